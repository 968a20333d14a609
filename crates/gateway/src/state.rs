use std::sync::Arc;

use fg_domain::config::Config;
use fg_security::{AuditLog, KeyManager, SecurityValidator};
use fg_sessions::{ContextStore, SessionRegistry};

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Security ──────────────────────────────────────────────────────
    /// Signing-key ring shared by the validator and the handshake path.
    pub keys: Arc<KeyManager>,
    /// Envelope validation pipeline (origin, signature, nonce, rate).
    pub validator: Arc<SecurityValidator>,
    /// Append-only trail behind `/v1/audit/recent`.
    pub audit: Arc<AuditLog>,

    // ── Sessions ──────────────────────────────────────────────────────
    pub sessions: Arc<SessionRegistry>,
    pub store: Arc<ContextStore>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}
