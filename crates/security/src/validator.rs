//! The ordered envelope-validation pipeline.
//!
//! Checks run in a fixed order: structure and payload size, origin trust,
//! signature, nonce freshness/uniqueness, timestamp sanity, rate limit,
//! and a content-safety scan. Structural failure short-circuits; every
//! other check runs so a rejection carries the complete reason list.
//!
//! Bookkeeping is atomic with validation: the nonce is recorded and the
//! rate counter bumped under the same per-session lock that performed the
//! checks. A nonce is consumed only when the envelope passes every check —
//! rate-limited and security rejections leave it untouched, so a corrected
//! retry is never punished for the earlier failure.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::RegexSet;

use fg_domain::config::SecurityConfig;
use fg_domain::{AuditEvent, AuditRecord};
use fg_protocol::Envelope;

use crate::audit_log::AuditLog;
use crate::keys::KeyManager;
use crate::ratelimit::{RateLimiter, SlidingWindow};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verdict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The outcome of validating one envelope. Never an `Err`: validation
/// always returns a verdict, and a partially valid envelope is simply
/// invalid.
#[derive(Debug)]
pub struct Verdict {
    pub valid: bool,
    pub failures: Vec<ValidationFailure>,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            valid: true,
            failures: Vec::new(),
        }
    }

    fn reject(failures: Vec<ValidationFailure>) -> Self {
        Self {
            valid: false,
            failures,
        }
    }

    /// Whether the only failures are transient (rate limiting).
    pub fn is_retryable(&self) -> bool {
        !self.valid
            && !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| matches!(f, ValidationFailure::RateLimited { .. }))
    }
}

/// A single reason an envelope was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    MissingSessionId,
    MissingNonce,
    MissingSignature,
    MissingOrigin,
    OversizedPayload { bytes: usize, max: usize },
    UntrustedOrigin(String),
    OriginChanged { recorded: String, claimed: String },
    BadSignature,
    ReplayedNonce,
    StaleTimestamp { age_secs: i64 },
    FutureTimestamp { ahead_secs: i64 },
    RateLimited { limit_per_minute: u32 },
    UnsafeContent(&'static str),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSessionId => write!(f, "session id is empty"),
            Self::MissingNonce => write!(f, "nonce is empty"),
            Self::MissingSignature => write!(f, "signature is empty"),
            Self::MissingOrigin => write!(f, "origin is empty"),
            Self::OversizedPayload { bytes, max } => {
                write!(f, "payload is {bytes} bytes (max {max})")
            }
            Self::UntrustedOrigin(origin) => write!(f, "origin not trusted: {origin}"),
            Self::OriginChanged { recorded, claimed } => {
                write!(f, "origin changed mid-session: {recorded} -> {claimed}")
            }
            Self::BadSignature => write!(f, "signature does not verify against any live key"),
            Self::ReplayedNonce => write!(f, "nonce was already accepted for this session"),
            Self::StaleTimestamp { age_secs } => {
                write!(f, "timestamp is {age_secs}s old")
            }
            Self::FutureTimestamp { ahead_secs } => {
                write!(f, "timestamp is {ahead_secs}s in the future")
            }
            Self::RateLimited { limit_per_minute } => {
                write!(f, "session exceeded {limit_per_minute} envelopes/minute")
            }
            Self::UnsafeContent(category) => write!(f, "unsafe payload content: {category}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session security state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Nonces, window counters, and origin-of-record for one session.
/// Created lazily on the first envelope; evicted by the inactivity sweep.
struct SessionSecurityState {
    window: SlidingWindow,
    /// Accepted nonces with the time each was recorded.
    seen_nonces: HashMap<String, DateTime<Utc>>,
    last_cleanup: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    origin_of_record: String,
}

impl SessionSecurityState {
    fn new(now: DateTime<Utc>, origin: &str) -> Self {
        Self {
            window: SlidingWindow::default(),
            seen_nonces: HashMap::new(),
            last_cleanup: now,
            last_seen: now,
            origin_of_record: origin.to_owned(),
        }
    }

    /// Purge nonces past the max age. The whole set ages out together,
    /// bounding memory without tracking each entry individually.
    fn maybe_cleanup(&mut self, now: DateTime<Utc>, max_age_secs: u64) {
        if (now - self.last_cleanup).num_seconds() < max_age_secs as i64 {
            return;
        }
        let cutoff = now - chrono::Duration::seconds(max_age_secs as i64);
        self.seen_nonces.retain(|_, recorded| *recorded > cutoff);
        self.last_cleanup = now;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Origin policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct OriginPolicy {
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

impl OriginPolicy {
    fn from_config(config: &SecurityConfig) -> Self {
        let mut exact: HashSet<String> =
            config.trusted_origins.iter().cloned().collect();

        // Deployment-specific extension, e.g. the institution's LMS host.
        if let Ok(raw) = std::env::var(&config.extra_origins_env) {
            for origin in raw.split(',') {
                let origin = origin.trim();
                if !origin.is_empty() {
                    exact.insert(origin.to_owned());
                }
            }
        }

        Self {
            exact,
            suffixes: config.trusted_origin_suffixes.clone(),
        }
    }

    fn is_trusted(&self, origin: &str) -> bool {
        if self.exact.contains(origin) {
            return true;
        }
        // Suffix match applies to the host part: "https://x.instructure.com"
        // matches ".instructure.com". Strip any port before comparing.
        let host = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest)
            .split(':')
            .next()
            .unwrap_or_default();
        self.suffixes.iter().any(|s| host.ends_with(s.as_str()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SecurityValidator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Injection signatures scanned in payloads: heuristic defense in depth on
/// top of origin + signature checks, not a substitute for them.
const UNSAFE_PATTERNS: &[(&str, &str)] = &[
    ("script tag", r"(?i)<\s*script"),
    ("event-handler attribute", r#"(?i)\bon[a-z]+\s*="#),
    ("javascript url", r"(?i)javascript\s*:"),
    (
        "sql keyword sequence",
        r"(?i)\b(union\s+select|drop\s+table|insert\s+into|delete\s+from)\b",
    ),
];

pub struct SecurityValidator {
    config: SecurityConfig,
    keys: Arc<KeyManager>,
    limiter: RateLimiter,
    origins: OriginPolicy,
    unsafe_set: RegexSet,
    states: Mutex<HashMap<String, SessionSecurityState>>,
    audit: Arc<AuditLog>,
}

impl SecurityValidator {
    pub fn new(config: SecurityConfig, keys: Arc<KeyManager>, audit: Arc<AuditLog>) -> Self {
        let unsafe_set = RegexSet::new(UNSAFE_PATTERNS.iter().map(|(_, p)| *p))
            .expect("unsafe-content patterns are valid regexes");
        Self {
            limiter: RateLimiter::new(config.rate_limit_per_minute),
            origins: OriginPolicy::from_config(&config),
            unsafe_set,
            config,
            keys,
            audit,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Validate one envelope, recording its nonce and rate-counter entry
    /// atomically on success. Never panics, never errors — always a
    /// [`Verdict`].
    pub fn validate(&self, envelope: &Envelope) -> Verdict {
        self.validate_at(envelope, Utc::now())
    }

    pub fn validate_at(&self, envelope: &Envelope, now: DateTime<Utc>) -> Verdict {
        // ── 1. Structure + payload ceiling (short-circuits) ──────────
        if let Some(failures) = self.check_structure(envelope) {
            return self.finish(envelope, now, Verdict::reject(failures));
        }

        let mut failures = Vec::new();

        // ── 2. Origin trust ──────────────────────────────────────────
        if !self.origins.is_trusted(&envelope.origin) {
            failures.push(ValidationFailure::UntrustedOrigin(envelope.origin.clone()));
        }

        // ── 3. Signature (active key, then grace-window keys) ────────
        if !self
            .keys
            .verify_at(&envelope.signing_base(), &envelope.signature, now)
        {
            failures.push(ValidationFailure::BadSignature);
        }

        // ── 5. Timestamp sanity ──────────────────────────────────────
        // (Checked before taking the session lock; nonce checks below
        // fold freshness into the same age bound.)
        let age_secs = (now - envelope.timestamp).num_seconds();
        if age_secs > self.config.max_message_age_secs as i64 {
            failures.push(ValidationFailure::StaleTimestamp { age_secs });
        } else if age_secs < -(self.config.clock_skew_secs as i64) {
            failures.push(ValidationFailure::FutureTimestamp {
                ahead_secs: -age_secs,
            });
        }

        // ── 7. Content-safety scan ───────────────────────────────────
        let payload_text = envelope.payload.to_string();
        for idx in self.unsafe_set.matches(&payload_text) {
            failures.push(ValidationFailure::UnsafeContent(UNSAFE_PATTERNS[idx].0));
        }

        // ── 4 + 6. Nonce + rate limit, atomic with bookkeeping ───────
        {
            let mut states = self.states.lock();
            let state = states
                .entry(envelope.session_id.clone())
                .or_insert_with(|| SessionSecurityState::new(now, &envelope.origin));

            state.maybe_cleanup(now, self.config.nonce_max_age_secs);

            if state.origin_of_record != envelope.origin {
                failures.push(ValidationFailure::OriginChanged {
                    recorded: state.origin_of_record.clone(),
                    claimed: envelope.origin.clone(),
                });
            }

            // Replay defense is unconditional: a reused nonce rejects the
            // envelope regardless of every other check.
            if state.seen_nonces.contains_key(&envelope.nonce) {
                failures.push(ValidationFailure::ReplayedNonce);
                AuditEvent::ReplayDetected {
                    session_id: envelope.session_id.clone(),
                    nonce: envelope.nonce.clone(),
                }
                .emit();
            }

            if self.limiter.would_exceed(&mut state.window, now) {
                failures.push(ValidationFailure::RateLimited {
                    limit_per_minute: self.limiter.limit_per_minute,
                });
                AuditEvent::RateLimitExceeded {
                    session_id: envelope.session_id.clone(),
                    limit_per_minute: self.limiter.limit_per_minute,
                }
                .emit();
            }

            if failures.is_empty() {
                // Idempotent consumption: nonce and counter recorded under
                // the same lock that ran the checks.
                state.seen_nonces.insert(envelope.nonce.clone(), now);
                state.window.record(now);
                state.last_seen = now;
            }
        }

        let verdict = if failures.is_empty() {
            Verdict::accept()
        } else {
            Verdict::reject(failures)
        };
        self.finish(envelope, now, verdict)
    }

    /// Evict security state for sessions idle past the configured timeout.
    pub fn sweep_states(&self, now: DateTime<Utc>) {
        let timeout = self.config.state_inactivity_secs;
        let mut evicted = Vec::new();
        {
            let mut states = self.states.lock();
            states.retain(|session_id, state| {
                let idle = (now - state.last_seen).num_seconds();
                let keep = idle < timeout as i64;
                if !keep {
                    evicted.push((session_id.clone(), idle.max(0) as u64));
                }
                keep
            });
        }
        for (session_id, idle_secs) in evicted {
            AuditEvent::SessionStateEvicted {
                session_id,
                idle_secs,
            }
            .emit();
        }
    }

    /// Number of sessions with live security state (for monitoring).
    pub fn tracked_sessions(&self) -> usize {
        self.states.lock().len()
    }

    // ── Private ──────────────────────────────────────────────────────

    fn check_structure(&self, envelope: &Envelope) -> Option<Vec<ValidationFailure>> {
        let mut failures = Vec::new();
        if envelope.session_id.is_empty() {
            failures.push(ValidationFailure::MissingSessionId);
        }
        if envelope.nonce.is_empty() {
            failures.push(ValidationFailure::MissingNonce);
        }
        if envelope.signature.is_empty() {
            failures.push(ValidationFailure::MissingSignature);
        }
        if envelope.origin.is_empty() {
            failures.push(ValidationFailure::MissingOrigin);
        }

        // Resource-exhaustion guard: reject oversized payloads before any
        // further work.
        let bytes = envelope.payload.to_string().len();
        if bytes > self.config.max_payload_bytes {
            failures.push(ValidationFailure::OversizedPayload {
                bytes,
                max: self.config.max_payload_bytes,
            });
        }

        if failures.is_empty() {
            None
        } else {
            Some(failures)
        }
    }

    fn finish(&self, envelope: &Envelope, now: DateTime<Utc>, verdict: Verdict) -> Verdict {
        let reasons: Vec<String> = verdict.failures.iter().map(|f| f.to_string()).collect();
        self.audit.append(AuditRecord {
            at: now,
            session_id: envelope.session_id.clone(),
            kind: envelope.kind.as_str().to_owned(),
            origin: envelope.origin.clone(),
            status: if verdict.valid { "accepted" } else { "rejected" },
            reasons: reasons.clone(),
        });

        if verdict.valid {
            AuditEvent::EnvelopeAccepted {
                session_id: envelope.session_id.clone(),
                kind: envelope.kind.as_str().to_owned(),
                origin: envelope.origin.clone(),
            }
            .emit();
        } else {
            AuditEvent::EnvelopeRejected {
                session_id: envelope.session_id.clone(),
                kind: envelope.kind.as_str().to_owned(),
                origin: envelope.origin.clone(),
                reasons,
            }
            .emit();
        }
        verdict
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
