use chrono::{DateTime, Utc};
use serde::Serialize;

/// Structured audit events emitted across all FrameGate crates.
///
/// Every security-relevant decision is emitted here in addition to being
/// appended to the queryable audit trail, so the JSON log stream alone is
/// enough to reconstruct what the validator rejected and why.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    EnvelopeAccepted {
        session_id: String,
        kind: String,
        origin: String,
    },
    EnvelopeRejected {
        session_id: String,
        kind: String,
        origin: String,
        reasons: Vec<String>,
    },
    ReplayDetected {
        session_id: String,
        nonce: String,
    },
    RateLimitExceeded {
        session_id: String,
        limit_per_minute: u32,
    },
    KeyRotated {
        new_key_id: String,
        retired_key_id: Option<String>,
    },
    KeyPurged {
        key_id: String,
    },
    SessionStateEvicted {
        session_id: String,
        idle_secs: u64,
    },
    SessionStarted {
        session_id: String,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },
    ObserverDropped {
        session_id: String,
        reason: String,
    },
    HandshakeCompleted {
        session_id: String,
        origin: String,
        accepted: bool,
    },
}

impl AuditEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(audit_event = %json, "fg_audit");
    }
}

/// One entry in the append-only audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub session_id: String,
    pub kind: String,
    pub origin: String,
    /// `"accepted"` or `"rejected"`.
    pub status: &'static str,
    /// Empty for accepted envelopes.
    pub reasons: Vec<String>,
}
