/// Shared error type used across all FrameGate crates.
///
/// The first five variants map one-to-one onto the failure categories the
/// messaging core distinguishes: structural rejections are final, security
/// violations fail closed and are audited, rate limiting is transient and
/// retryable, transport failures drive channel reconnection, and persistence
/// failures abort the commit of a state mutation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("structural: {0}")]
    Structural(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("rate limited: session {session_id} exceeded {limit}/min")]
    RateLimited { session_id: String, limit: u32 },

    #[error("transport: {0}")]
    Transport(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the failed operation.
    ///
    /// Rate-limited and persistence failures are transient; everything else
    /// is either final (structural, security) or handled internally by the
    /// channel (transport).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Persistence(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
