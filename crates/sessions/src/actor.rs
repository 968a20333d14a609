//! Single-writer session actors.
//!
//! One tokio task conceptually owns each session id: every request for that
//! session is serialized through its mpsc mailbox, so no two mutations of
//! the same [`SessionContextState`] ever interleave. Different sessions run
//! fully in parallel.
//!
//! Mutations commit write-then-apply: the candidate state is persisted
//! first, and only a successful durable write updates the in-memory copy
//! and triggers the observer broadcast. Broadcast is best-effort — an
//! observer whose buffer is full or whose receiver is gone is removed
//! without affecting the others or failing the mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use fg_domain::config::SessionsConfig;
use fg_domain::error::{Error, Result};
use fg_domain::AuditEvent;
use fg_protocol::{AssessmentAction, AssessmentPayload, ContentRef, NavigationPayload};

use crate::state::SessionContextState;
use crate::store::ContextStore;

const MAILBOX_DEPTH: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events & commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Broadcast to every observer attached to a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ContextUpdated {
        state: SessionContextState,
    },
    NavigationRecorded {
        content_id: String,
        previous_content_id: Option<String>,
        duration_ms: Option<u64>,
    },
    AssessmentChanged {
        assessment_id: String,
        action: AssessmentAction,
        active: Vec<String>,
    },
    /// Forwarded, already-validated signal for downstream consumers.
    SignalReceived {
        kind: String,
        payload: serde_json::Value,
    },
    SessionEnded {
        reason: String,
    },
}

enum Command {
    Update {
        student_id: Option<String>,
        current_content: Option<ContentRef>,
        reply: oneshot::Sender<Result<SessionContextState>>,
    },
    Navigation {
        payload: NavigationPayload,
        reply: oneshot::Sender<Result<SessionContextState>>,
    },
    Assessment {
        payload: AssessmentPayload,
        reply: oneshot::Sender<Result<SessionContextState>>,
    },
    Forward {
        kind: String,
        payload: serde_json::Value,
    },
    Snapshot {
        reply: oneshot::Sender<SessionContextState>,
    },
    Attach {
        observer: mpsc::Sender<SessionEvent>,
    },
    End {
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cheap, cloneable address of one session actor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn update_context(
        &self,
        student_id: Option<String>,
        current_content: Option<ContentRef>,
    ) -> Result<SessionContextState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update {
            student_id,
            current_content,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Self::gone())?
    }

    pub async fn record_navigation(
        &self,
        payload: NavigationPayload,
    ) -> Result<SessionContextState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Navigation { payload, reply }).await?;
        rx.await.map_err(|_| Self::gone())?
    }

    pub async fn set_assessment_state(
        &self,
        payload: AssessmentPayload,
    ) -> Result<SessionContextState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Assessment { payload, reply }).await?;
        rx.await.map_err(|_| Self::gone())?
    }

    /// Fan an already-validated signal out to observers without mutating
    /// context state.
    pub async fn forward_signal(&self, kind: String, payload: serde_json::Value) -> Result<()> {
        self.send(Command::Forward { kind, payload }).await
    }

    pub async fn snapshot(&self) -> Result<SessionContextState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| Self::gone())
    }

    /// Attach an observer; it receives every broadcast until it lags or
    /// disconnects.
    pub async fn attach(&self, observer: mpsc::Sender<SessionEvent>) -> Result<()> {
        self.send(Command::Attach { observer }).await
    }

    pub async fn end(&self, reason: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::End {
            reason: reason.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Self::gone())?
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::SessionNotFound(self.session_id.clone()))
    }

    fn gone() -> Error {
        Error::Other("session actor dropped the reply".into())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hands out actor addresses, spawning (and rehydrating) actors lazily on
/// the first request for a session id.
pub struct SessionRegistry {
    config: SessionsConfig,
    store: Arc<ContextStore>,
    actors: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(config: SessionsConfig, store: Arc<ContextStore>) -> Self {
        Self {
            config,
            store,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Get the live handle for `session_id`, spawning the actor if needed.
    /// A previously persisted context is rehydrated from the store.
    pub fn handle(&self, session_id: &str) -> SessionHandle {
        let mut actors = self.actors.lock();
        if let Some(existing) = actors.get(session_id) {
            if existing.is_open() {
                return existing.clone();
            }
        }

        let now = Utc::now();
        let state = match self.store.get(session_id) {
            Some(state) => state,
            None => {
                AuditEvent::SessionStarted {
                    session_id: session_id.to_owned(),
                }
                .emit();
                SessionContextState::new(session_id, now)
            }
        };

        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let handle = SessionHandle {
            session_id: session_id.to_owned(),
            tx,
        };
        actors.insert(session_id.to_owned(), handle.clone());

        let actor = SessionActor {
            state,
            store: self.store.clone(),
            config: self.config.clone(),
            observers: Vec::new(),
        };
        tokio::spawn(actor.run(rx));

        handle
    }

    /// The live handle for an existing session, without spawning one.
    pub fn existing(&self, session_id: &str) -> Option<SessionHandle> {
        let actors = self.actors.lock();
        actors
            .get(session_id)
            .filter(|h| h.is_open())
            .cloned()
            .or_else(|| {
                // Persisted but not yet rehydrated counts as existing.
                drop(actors);
                self.store.get(session_id).map(|_| self.handle(session_id))
            })
    }

    /// Drop registry entries whose actors have exited.
    pub fn prune(&self) {
        self.actors.lock().retain(|_, h| h.is_open());
    }

    pub fn live_sessions(&self) -> usize {
        self.actors.lock().values().filter(|h| h.is_open()).count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionActor {
    state: SessionContextState,
    store: Arc<ContextStore>,
    config: SessionsConfig,
    observers: Vec<mpsc::Sender<SessionEvent>>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut cleanup = tokio::time::interval(Duration::from_secs(
            self.config.cleanup_tick_secs.max(1),
        ));
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick.
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd) {
                                return;
                            }
                        }
                        // Registry dropped and no handles remain.
                        None => return,
                    }
                }
                _ = cleanup.tick() => {
                    let idle = (Utc::now() - self.state.last_updated).num_seconds();
                    if idle >= self.config.inactivity_timeout_secs as i64 {
                        self.retire("inactivity timeout");
                        return;
                    }
                }
            }
        }
    }

    /// Returns `true` when the actor should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Update {
                student_id,
                current_content,
                reply,
            } => {
                let mut candidate = self.state.clone();
                candidate.apply_update(student_id, current_content, Utc::now());
                let result = self.commit(candidate).map(|()| self.state.clone());
                if result.is_ok() {
                    self.broadcast(SessionEvent::ContextUpdated {
                        state: self.state.clone(),
                    });
                }
                let _ = reply.send(result);
                false
            }
            Command::Navigation { payload, reply } => {
                let mut candidate = self.state.clone();
                let duration_ms = candidate.record_navigation(
                    &payload,
                    Utc::now(),
                    self.config.navigation_history_cap,
                );
                let result = self.commit(candidate).map(|()| self.state.clone());
                if result.is_ok() {
                    self.broadcast(SessionEvent::NavigationRecorded {
                        content_id: payload.content_id.clone(),
                        previous_content_id: payload.previous_content_id.clone(),
                        duration_ms,
                    });
                }
                let _ = reply.send(result);
                false
            }
            Command::Assessment { payload, reply } => {
                let mut candidate = self.state.clone();
                candidate.apply_assessment(&payload, Utc::now());
                let result = self.commit(candidate).map(|()| self.state.clone());
                if result.is_ok() {
                    self.broadcast(SessionEvent::AssessmentChanged {
                        assessment_id: payload.assessment_id.clone(),
                        action: payload.action,
                        active: self.state.active_assessment_ids.iter().cloned().collect(),
                    });
                }
                let _ = reply.send(result);
                false
            }
            Command::Forward { kind, payload } => {
                self.broadcast(SessionEvent::SignalReceived { kind, payload });
                false
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
                false
            }
            Command::Attach { observer } => {
                self.observers.push(observer);
                false
            }
            Command::End { reason, reply } => {
                if let Err(e) = self.store.remove(&self.state.session_id) {
                    let _ = reply.send(Err(e));
                    return false;
                }
                AuditEvent::SessionEnded {
                    session_id: self.state.session_id.clone(),
                    reason: reason.clone(),
                }
                .emit();
                self.broadcast(SessionEvent::SessionEnded { reason });
                let _ = reply.send(Ok(()));
                true
            }
        }
    }

    /// Write-then-apply: persist the candidate, and only on success make it
    /// the actor's state.
    fn commit(&mut self, candidate: SessionContextState) -> Result<()> {
        self.store.persist(&candidate)?;
        self.state = candidate;
        Ok(())
    }

    /// Best-effort fanout. A full or closed observer channel drops that
    /// observer; the rest are unaffected.
    fn broadcast(&mut self, event: SessionEvent) {
        let session_id = self.state.session_id.clone();
        self.observers.retain(|observer| {
            match observer.try_send(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    AuditEvent::ObserverDropped {
                        session_id: session_id.clone(),
                        reason: match e {
                            mpsc::error::TrySendError::Full(_) => "buffer full".into(),
                            mpsc::error::TrySendError::Closed(_) => "disconnected".into(),
                        },
                    }
                    .emit();
                    false
                }
            }
        });
    }

    fn retire(&mut self, reason: &str) {
        if let Err(e) = self.store.remove(&self.state.session_id) {
            tracing::warn!(
                session_id = %self.state.session_id,
                error = %e,
                "failed to remove durable state on retirement"
            );
        }
        AuditEvent::SessionEnded {
            session_id: self.state.session_id.clone(),
            reason: reason.to_owned(),
        }
        .emit();
        self.broadcast(SessionEvent::SessionEnded {
            reason: reason.to_owned(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> SessionRegistry {
        let store = Arc::new(ContextStore::new(dir).unwrap());
        SessionRegistry::new(SessionsConfig::default(), store)
    }

    fn nav(content_id: &str, previous: Option<&str>) -> NavigationPayload {
        NavigationPayload {
            content_id: content_id.into(),
            page_type: "reading".into(),
            url: format!("/content/{content_id}"),
            previous_content_id: previous.map(String::from),
        }
    }

    #[tokio::test]
    async fn update_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let handle = registry.handle("s1");

        let state = handle
            .update_context(Some("stu-1".into()), None)
            .await
            .unwrap();
        assert_eq!(state.student_id.as_deref(), Some("stu-1"));

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.student_id.as_deref(), Some("stu-1"));
    }

    #[tokio::test]
    async fn navigation_broadcasts_to_observers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let handle = registry.handle("s1");

        let (tx, mut rx) = mpsc::channel(8);
        handle.attach(tx).await.unwrap();

        handle.record_navigation(nav("a", None)).await.unwrap();
        handle.record_navigation(nav("b", Some("a"))).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::NavigationRecorded { ref content_id, .. } if content_id == "a"));
        let second = rx.recv().await.unwrap();
        match second {
            SessionEvent::NavigationRecorded {
                content_id,
                previous_content_id,
                duration_ms,
            } => {
                assert_eq!(content_id, "b");
                assert_eq!(previous_content_id.as_deref(), Some("a"));
                assert!(duration_ms.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let h1 = registry.handle("s1");
        let h2 = registry.handle("s2");

        let (tx2, mut rx2) = mpsc::channel(8);
        h2.attach(tx2).await.unwrap();

        h1.update_context(Some("stu-1".into()), None).await.unwrap();
        h1.record_navigation(nav("a", None)).await.unwrap();

        // Session 2 saw none of session 1's activity.
        let snap2 = h2.snapshot().await.unwrap();
        assert!(snap2.student_id.is_none());
        assert!(snap2.navigation_history.is_empty());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_session_removes_state_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContextStore::new(dir.path()).unwrap());
        let registry = SessionRegistry::new(SessionsConfig::default(), store.clone());
        let handle = registry.handle("s1");

        let (tx, mut rx) = mpsc::channel(8);
        handle.attach(tx).await.unwrap();

        handle.update_context(None, None).await.unwrap();
        assert!(store.get("s1").is_some());

        handle.end("client request").await.unwrap();
        assert!(store.get("s1").is_none());

        // Observer got the update then the end notice.
        let mut saw_end = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, SessionEvent::SessionEnded { .. }) {
                saw_end = true;
            }
        }
        assert!(saw_end);

        // Further sends fail: the actor is gone.
        registry.prune();
        assert_eq!(registry.live_sessions(), 0);
    }

    #[tokio::test]
    async fn actor_rehydrates_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContextStore::new(dir.path()).unwrap());

        {
            let registry = SessionRegistry::new(SessionsConfig::default(), store.clone());
            let handle = registry.handle("s1");
            handle
                .update_context(Some("stu-7".into()), None)
                .await
                .unwrap();
        }

        // New registry, same store: first touch rehydrates.
        let registry = SessionRegistry::new(SessionsConfig::default(), store);
        let handle = registry.handle("s1");
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.student_id.as_deref(), Some("stu-7"));
    }

    #[tokio::test]
    async fn lagging_observer_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let handle = registry.handle("s1");

        // Capacity-1 observer that never drains.
        let (tx, _rx) = mpsc::channel(1);
        handle.attach(tx).await.unwrap();

        let (healthy_tx, mut healthy_rx) = mpsc::channel(8);
        handle.attach(healthy_tx).await.unwrap();

        // First event fills the laggard, second overflows it.
        handle.update_context(Some("a".into()), None).await.unwrap();
        handle.update_context(Some("b".into()), None).await.unwrap();
        handle.update_context(Some("c".into()), None).await.unwrap();

        // The healthy observer still receives everything.
        for _ in 0..3 {
            assert!(healthy_rx.recv().await.is_some());
        }
    }
}
