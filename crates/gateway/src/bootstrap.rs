//! AppState construction and background-task spawning extracted from
//! `main.rs` so CLI commands can boot the runtime without a listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};

use fg_domain::config::{Config, ConfigSeverity};
use fg_security::{AuditLog, KeyManager, SecurityValidator};
use fg_sessions::{ContextStore, SessionRegistry};

use crate::state::AppState;

const SWEEP_TICK: Duration = Duration::from_secs(60);

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Key ring ─────────────────────────────────────────────────────
    let keys = Arc::new(KeyManager::new(
        config.security.key_lifetime_secs,
        config.security.key_grace_secs,
    ));
    tracing::info!(
        lifetime_secs = config.security.key_lifetime_secs,
        grace_secs = config.security.key_grace_secs,
        "signing-key ring ready"
    );

    // ── Audit trail + validator ──────────────────────────────────────
    let audit = Arc::new(AuditLog::default());
    let validator = Arc::new(SecurityValidator::new(
        config.security.clone(),
        keys.clone(),
        audit.clone(),
    ));
    tracing::info!(
        rate_limit_per_minute = config.security.rate_limit_per_minute,
        max_payload_bytes = config.security.max_payload_bytes,
        "security validator ready"
    );

    // ── Session context store + registry ─────────────────────────────
    let store =
        Arc::new(ContextStore::new(&config.state.path).context("initializing context store")?);
    let sessions = Arc::new(SessionRegistry::new(config.sessions.clone(), store.clone()));
    tracing::info!(
        persisted_sessions = store.len(),
        inactivity_timeout_secs = config.sessions.inactivity_timeout_secs,
        "session registry ready"
    );

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(token) => {
                tracing::info!(env_var = %env_var, "API token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!(
                    env_var = %env_var,
                    "no API token configured — collaborator endpoints are unauthenticated (dev mode)"
                );
                None
            }
        }
    };

    Ok(AppState {
        config,
        keys,
        validator,
        audit,
        sessions,
        store,
        api_token_hash,
    })
}

/// Spawn the recurring maintenance loops: key rotation/purge, security-state
/// eviction, and dead-actor pruning.
pub fn spawn_background_tasks(state: &AppState) {
    let keys = state.keys.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            keys.sweep(Utc::now());
        }
    });

    let validator = state.validator.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            validator.sweep_states(Utc::now());
        }
    });

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            sessions.prune();
        }
    });

    tracing::info!("background sweeps scheduled (keys, security state, actors)");
}
