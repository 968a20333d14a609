//! Durable session-context storage.
//!
//! Persists every session's context in `contexts.json` under the configured
//! state path. Actors call [`ContextStore::persist`] with the *candidate*
//! state before applying it in memory (write-then-apply), so a crash
//! between the two steps can only lose an uncommitted mutation, never a
//! committed one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use fg_domain::error::{Error, Result};

use crate::state::SessionContextState;

/// JSON-file-backed store for [`SessionContextState`].
pub struct ContextStore {
    contexts_path: PathBuf,
    contexts: RwLock<HashMap<String, SessionContextState>>,
}

impl ContextStore {
    /// Load or create the store at `state_path/sessions/contexts.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let contexts_path = dir.join("contexts.json");
        let contexts = if contexts_path.exists() {
            let raw = std::fs::read_to_string(&contexts_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = contexts.len(),
            path = %contexts_path.display(),
            "context store loaded"
        );

        Ok(Self {
            contexts_path,
            contexts: RwLock::new(contexts),
        })
    }

    /// Look up a session's persisted context.
    pub fn get(&self, session_id: &str) -> Option<SessionContextState> {
        self.contexts.read().get(session_id).cloned()
    }

    /// Durably record `state`. The in-memory map is only updated after the
    /// file write succeeds; on failure the previous durable copy stands and
    /// the caller must not apply the mutation.
    pub fn persist(&self, state: &SessionContextState) -> Result<()> {
        let mut contexts = self.contexts.write();
        let previous = contexts.insert(state.session_id.clone(), state.clone());

        if let Err(e) = self.write_locked(&contexts) {
            // Roll the map back so memory matches disk.
            match previous {
                Some(prev) => contexts.insert(state.session_id.clone(), prev),
                None => contexts.remove(&state.session_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a session's durable state (session end or timeout cleanup).
    pub fn remove(&self, session_id: &str) -> Result<()> {
        let mut contexts = self.contexts.write();
        let previous = contexts.remove(session_id);
        if previous.is_none() {
            return Ok(());
        }

        if let Err(e) = self.write_locked(&contexts) {
            if let Some(prev) = previous {
                contexts.insert(session_id.to_owned(), prev);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Session ids with persisted state (used to rehydrate after restart).
    pub fn session_ids(&self) -> Vec<String> {
        self.contexts.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    // ── Private ──────────────────────────────────────────────────────

    fn write_locked(&self, contexts: &HashMap<String, SessionContextState>) -> Result<()> {
        let json = serde_json::to_string_pretty(contexts)
            .map_err(|e| Error::Persistence(format!("serializing contexts: {e}")))?;
        std::fs::write(&self.contexts_path, json)
            .map_err(|e| Error::Persistence(format!("writing {}: {e}", self.contexts_path.display())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
