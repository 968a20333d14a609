use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub state: StateConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_4810")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Environment variable holding the API bearer token for the collaborator
    /// endpoints (context, audit, admin). If the env var is set and non-empty,
    /// those endpoints require `Authorization: Bearer <token>`.
    /// If unset, the server logs a warning and allows unauthenticated access.
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    /// Per-IP token-bucket rate limiting for the HTTP surface.
    /// When `None` (the default), it is disabled — suitable for local
    /// development.  This is separate from the per-session envelope rate
    /// limiter, which is always on.
    #[serde(default)]
    pub rate_limit: Option<IpRateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4810,
            host: "127.0.0.1".into(),
            cors: CorsConfig::default(),
            api_token_env: d_api_token_env(),
            rate_limit: None,
        }
    }
}

/// Per-IP token-bucket rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRateLimitConfig {
    /// Quota replenishment rate — one token every `1 / requests_per_second` seconds.
    pub requests_per_second: u64,
    /// Maximum tokens in the bucket.
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    /// Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security (envelope validation, keys, per-session rate limit)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Origins trusted to send envelopes. Exact matches only; use
    /// `trusted_origin_suffixes` for subdomain patterns.
    #[serde(default = "d_trusted_origins")]
    pub trusted_origins: Vec<String>,
    /// Suffix patterns for trusted subdomains, e.g. `".instructure.com"`.
    #[serde(default = "d_trusted_suffixes")]
    pub trusted_origin_suffixes: Vec<String>,
    /// Environment variable with a comma-separated allow-list extension.
    #[serde(default = "d_extra_origins_env")]
    pub extra_origins_env: String,
    /// Hard ceiling on serialized payload size, in bytes. Oversized
    /// envelopes are rejected before any other check runs.
    #[serde(default = "d_64k")]
    pub max_payload_bytes: usize,
    /// Maximum accepted envelope age in seconds.
    #[serde(default = "d_300")]
    pub max_message_age_secs: u64,
    /// Allowance for clocks running ahead of ours, in seconds.
    #[serde(default = "d_60")]
    pub clock_skew_secs: u64,
    /// Maximum nonce age before the per-session nonce set is purged.
    #[serde(default = "d_300")]
    pub nonce_max_age_secs: u64,
    /// Per-session envelope ceiling over the sliding one-minute window.
    #[serde(default = "d_120")]
    pub rate_limit_per_minute: u32,
    /// Active lifetime of a signing key, in seconds (default 24h).
    #[serde(default = "d_key_lifetime")]
    pub key_lifetime_secs: u64,
    /// Grace period after rotation during which a retired key still
    /// verifies, in seconds (default 48h).
    #[serde(default = "d_key_grace")]
    pub key_grace_secs: u64,
    /// Idle time after which a session's security state (nonces, window
    /// counters) is evicted, in seconds.
    #[serde(default = "d_1800")]
    pub state_inactivity_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_origins: d_trusted_origins(),
            trusted_origin_suffixes: d_trusted_suffixes(),
            extra_origins_env: d_extra_origins_env(),
            max_payload_bytes: 64 * 1024,
            max_message_age_secs: 300,
            clock_skew_secs: 60,
            nonce_max_age_secs: 300,
            rate_limit_per_minute: 120,
            key_lifetime_secs: 24 * 3600,
            key_grace_secs: 48 * 3600,
            state_inactivity_secs: 1800,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions (context actors)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum navigation-history entries kept per session (FIFO eviction).
    #[serde(default = "d_50")]
    pub navigation_history_cap: usize,
    /// Idle time after which a session actor retires itself and removes
    /// its durable state, in seconds.
    #[serde(default = "d_3600")]
    pub inactivity_timeout_secs: u64,
    /// How often each actor wakes to check for inactivity, in seconds.
    #[serde(default = "d_60")]
    pub cleanup_tick_secs: u64,
    /// Per-observer event buffer. A subscriber that falls this far behind
    /// is dropped rather than blocking the actor.
    #[serde(default = "d_64")]
    pub observer_buffer: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            navigation_history_cap: 50,
            inactivity_timeout_secs: 3600,
            cleanup_tick_secs: 60,
            observer_buffer: 64,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel (tool-side secure channel client)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Seconds between heartbeat envelopes while connected.
    #[serde(default = "d_30")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed heartbeats before the channel reconnects.
    #[serde(default = "d_3")]
    pub heartbeat_failure_limit: u32,
    /// Queued envelopes older than this are dropped at flush time, secs.
    #[serde(default = "d_30")]
    pub message_timeout_secs: u64,
    /// Capacity of the offline outbox ring (oldest dropped on overflow).
    #[serde(default = "d_256")]
    pub outbox_capacity: usize,
    /// Initial reconnect delay in milliseconds.
    #[serde(default = "d_1000")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds.
    #[serde(default = "d_30000")]
    pub reconnect_max_ms: u64,
    /// Reconnect attempts before the channel surfaces a terminal error.
    #[serde(default = "d_10")]
    pub reconnect_max_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_failure_limit: 3,
            message_timeout_secs: 30,
            outbox_capacity: 256,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State (durable storage)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/state"),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_4810() -> u16 {
    4810
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:*".into(),
        "http://127.0.0.1:*".into(),
    ]
}
fn d_api_token_env() -> String {
    "FRAMEGATE_API_TOKEN".into()
}
fn d_trusted_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".into(),
        "http://127.0.0.1:3000".into(),
    ]
}
fn d_trusted_suffixes() -> Vec<String> {
    vec![".instructure.com".into(), ".moodlecloud.com".into()]
}
fn d_extra_origins_env() -> String {
    "FRAMEGATE_EXTRA_ORIGINS".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_64k() -> usize {
    64 * 1024
}
fn d_300() -> u64 {
    300
}
fn d_60() -> u64 {
    60
}
fn d_120() -> u32 {
    120
}
fn d_key_lifetime() -> u64 {
    24 * 3600
}
fn d_key_grace() -> u64 {
    48 * 3600
}
fn d_1800() -> u64 {
    1800
}
fn d_50() -> usize {
    50
}
fn d_3600() -> u64 {
    3600
}
fn d_64() -> usize {
    64
}
fn d_30() -> u64 {
    30
}
fn d_3() -> u32 {
    3
}
fn d_256() -> usize {
    256
}
fn d_1000() -> u64 {
    1000
}
fn d_30000() -> u64 {
    30_000
}
fn d_10() -> u32 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.security.trusted_origins.is_empty()
            && self.security.trusted_origin_suffixes.is_empty()
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "security.trusted_origins".into(),
                message: "at least one trusted origin or suffix is required".into(),
            });
        }

        if self.security.rate_limit_per_minute == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "security.rate_limit_per_minute".into(),
                message: "rate limit must be greater than 0".into(),
            });
        }

        // A grace period shorter than the message timeout would invalidate
        // envelopes queued across a rotation.
        if self.security.key_grace_secs < self.channel.message_timeout_secs {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "security.key_grace_secs".into(),
                message: "grace period shorter than channel message timeout".into(),
            });
        }

        if self.sessions.navigation_history_cap == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.navigation_history_cap".into(),
                message: "history cap must be greater than 0".into(),
            });
        }

        // CORS: warn if wildcard is used.
        if self.server.cors.allowed_origins.len() == 1
            && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.cors.allowed_origins".into(),
                message: "wildcard \"*\" allows all origins (not recommended for production)"
                    .into(),
            });
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
