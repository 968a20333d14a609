//! Symmetric signing-key ring with scheduled rotation and a verification
//! grace window.
//!
//! Exactly one key is active at a time; envelopes are always signed with
//! it.  When a key expires it is demoted but kept for `grace` so messages
//! signed just before rotation still verify, then purged.  Rotation happens
//! lazily (whenever `current` finds the active key expired) and on the
//! periodic sweep the gateway schedules.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use fg_domain::AuditEvent;

type HmacSha256 = Hmac<Sha256>;

const SECRET_LEN: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One symmetric signing key. Secret material never leaves this module.
#[derive(Clone)]
struct SigningKey {
    id: String,
    secret: [u8; SECRET_LEN],
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    active: bool,
}

impl SigningKey {
    fn mint(now: DateTime<Utc>, lifetime: Duration) -> Self {
        use rand::RngCore;
        let mut secret = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret,
            created_at: now,
            expires_at: now + lifetime,
            active: true,
        }
    }

    fn mac_hex(&self, base: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(base.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Public snapshot of one ring entry (no secret material).
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    /// Retired but still usable for verification.
    pub in_grace: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KeyManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns the signing-key ring.  An explicit, injected instance — never
/// ambient global state.
pub struct KeyManager {
    lifetime: Duration,
    grace: Duration,
    ring: RwLock<Vec<SigningKey>>,
}

impl KeyManager {
    pub fn new(lifetime_secs: u64, grace_secs: u64) -> Self {
        let lifetime = Duration::seconds(lifetime_secs as i64);
        let now = Utc::now();
        Self {
            lifetime,
            grace: Duration::seconds(grace_secs as i64),
            ring: RwLock::new(vec![SigningKey::mint(now, lifetime)]),
        }
    }

    /// Sign `base` with the current active key, rotating first if it has
    /// expired.  Returns the hex-encoded MAC.
    pub fn sign(&self, base: &str) -> String {
        self.sign_at(base, Utc::now())
    }

    pub fn sign_at(&self, base: &str, now: DateTime<Utc>) -> String {
        let mut ring = self.ring.write();
        Self::rotate_if_expired(&mut ring, self.lifetime, now);
        // rotate_if_expired guarantees an active entry exists.
        ring.iter()
            .find(|k| k.active)
            .map(|k| k.mac_hex(base))
            .unwrap_or_default()
    }

    /// Verify `signature` against the active key, then against every
    /// retired key still inside its grace window.  First match wins.
    pub fn verify(&self, base: &str, signature: &str) -> bool {
        self.verify_at(base, signature, Utc::now())
    }

    pub fn verify_at(&self, base: &str, signature: &str, now: DateTime<Utc>) -> bool {
        let ring = self.ring.read();
        let mut candidates: Vec<&SigningKey> = ring.iter().filter(|k| k.active).collect();
        candidates.extend(
            ring.iter()
                .filter(|k| !k.active && now < k.expires_at + self.grace),
        );

        candidates.iter().any(|key| {
            let computed = key.mac_hex(base);
            // Constant-time comparison to prevent timing attacks.
            computed.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 1
        })
    }

    /// Force a rotation: demote the active key and mint a fresh one.
    pub fn rotate(&self) -> KeyStatus {
        self.rotate_at(Utc::now())
    }

    pub fn rotate_at(&self, now: DateTime<Utc>) -> KeyStatus {
        let mut ring = self.ring.write();
        let retired_id = ring.iter_mut().find(|k| k.active).map(|k| {
            k.active = false;
            k.id.clone()
        });
        let fresh = SigningKey::mint(now, self.lifetime);
        let status = KeyStatus {
            id: fresh.id.clone(),
            created_at: fresh.created_at,
            expires_at: fresh.expires_at,
            active: true,
            in_grace: false,
        };
        ring.push(fresh);

        AuditEvent::KeyRotated {
            new_key_id: status.id.clone(),
            retired_key_id: retired_id,
        }
        .emit();

        status
    }

    /// Periodic maintenance: rotate when the active key has expired and
    /// purge retired keys past their grace deadline.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let purged: Vec<String> = {
            let mut ring = self.ring.write();
            Self::rotate_if_expired(&mut ring, self.lifetime, now);

            let grace = self.grace;
            let mut purged = Vec::new();
            ring.retain(|k| {
                let keep = k.active || now < k.expires_at + grace;
                if !keep {
                    purged.push(k.id.clone());
                }
                keep
            });
            purged
        };

        for key_id in purged {
            AuditEvent::KeyPurged { key_id }.emit();
        }
    }

    /// Snapshot of the ring for the admin surface.
    pub fn statuses(&self) -> Vec<KeyStatus> {
        self.statuses_at(Utc::now())
    }

    pub fn statuses_at(&self, now: DateTime<Utc>) -> Vec<KeyStatus> {
        self.ring
            .read()
            .iter()
            .map(|k| KeyStatus {
                id: k.id.clone(),
                created_at: k.created_at,
                expires_at: k.expires_at,
                active: k.active,
                in_grace: !k.active && now < k.expires_at + self.grace,
            })
            .collect()
    }

    // ── Private ──────────────────────────────────────────────────────

    fn rotate_if_expired(ring: &mut Vec<SigningKey>, lifetime: Duration, now: DateTime<Utc>) {
        let expired = match ring.iter().find(|k| k.active) {
            Some(k) => now >= k.expires_at,
            None => true,
        };
        if !expired {
            return;
        }

        let retired_id = ring.iter_mut().find(|k| k.active).map(|k| {
            k.active = false;
            k.id.clone()
        });
        let fresh = SigningKey::mint(now, lifetime);
        AuditEvent::KeyRotated {
            new_key_id: fresh.id.clone(),
            retired_key_id: retired_id,
        }
        .emit();
        ring.push(fresh);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
