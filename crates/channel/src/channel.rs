//! Secure channel client — manages the WebSocket lifecycle, the signed
//! handshake, heartbeats, and the offline outbox.
//!
//! The channel owns one connection at a time.  Callers push outbound
//! envelopes through an mpsc sender and receive inbound ones (accepted
//! interventions and other gateway-pushed envelopes) through an mpsc
//! receiver; the channel signs every envelope immediately before it hits
//! the wire, never at enqueue time, so a flush after a key rotation still
//! carries valid signatures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use fg_domain::config::ChannelConfig;
use fg_protocol::{
    Envelope, EnvelopeKind, HandshakeRequestPayload, HandshakeResponsePayload, HandshakeStatus,
    HeartbeatPayload, PROTOCOL_VERSION,
};
use fg_security::KeyManager;

use crate::backoff::ReconnectBackoff;
use crate::outbox::Outbox;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State & errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection lifecycle of the channel.  Heartbeating is a mode of
/// `Connected`, not a distinct state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    HandshakeSent,
    Connected,
    Reconnecting,
}

/// Terminal channel errors.  Transport-level failures are handled
/// internally by reconnecting and never surface here.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("shutdown")]
    Shutdown,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SecureChannel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully-configured channel ready to connect to the gateway ingest
/// endpoint.
pub struct SecureChannel {
    gateway_ws_url: String,
    session_id: String,
    origin: String,
    capabilities: Vec<String>,
    keys: Arc<KeyManager>,
    config: ChannelConfig,
    backoff: ReconnectBackoff,
    state_tx: watch::Sender<ChannelState>,
}

impl SecureChannel {
    pub fn new(
        gateway_ws_url: impl Into<String>,
        session_id: impl Into<String>,
        origin: impl Into<String>,
        keys: Arc<KeyManager>,
        config: ChannelConfig,
    ) -> Self {
        let backoff = ReconnectBackoff::from_config(&config);
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            gateway_ws_url: gateway_ws_url.into(),
            session_id: session_id.into(),
            origin: origin.into(),
            capabilities: vec!["page_context".into(), "behavioral_signals".into()],
            keys,
            config,
            backoff,
            state_tx,
        }
    }

    pub fn capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Run the channel.  Connects to the gateway, performs the signed
    /// handshake, flushes the outbox, and enters the message loop.  On
    /// disconnection, automatically reconnects per the
    /// [`ReconnectBackoff`] policy; envelopes produced while disconnected
    /// queue in the bounded outbox.
    ///
    /// Returns only on handshake rejection, `max_attempts` exhaustion, or
    /// when the `shutdown` token is cancelled.
    pub async fn run(
        self,
        mut outbound: mpsc::Receiver<Envelope>,
        inbound: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> Result<(), ChannelError> {
        let mut outbox = Outbox::new(self.config.outbox_capacity);
        let mut producer_open = true;
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Err(ChannelError::Shutdown);
            }

            let result = tokio::select! {
                r = self.connect_and_run(&mut outbound, &inbound, &mut outbox, &mut producer_open) => r,
                _ = shutdown.cancelled() => {
                    tracing::info!(session_id = %self.session_id, "shutdown requested");
                    self.set_state(ChannelState::Disconnected);
                    return Err(ChannelError::Shutdown);
                }
            };

            match result {
                Ok(handshake_completed) => {
                    tracing::info!(
                        session_id = %self.session_id,
                        handshake_completed,
                        "connection closed"
                    );
                    // Only reset backoff after a completed handshake, not
                    // merely after TCP connect.
                    if handshake_completed {
                        attempt = 0;
                    }
                }
                Err(e @ ChannelError::HandshakeRejected(_)) => {
                    self.set_state(ChannelState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        attempt,
                        error = %e,
                        "connection lost"
                    );
                }
            }

            if self.backoff.should_give_up(attempt) {
                tracing::error!(
                    session_id = %self.session_id,
                    attempts = attempt,
                    "max reconnect attempts exhausted"
                );
                self.set_state(ChannelState::Disconnected);
                return Err(ChannelError::ReconnectExhausted(attempt));
            }

            self.set_state(ChannelState::Reconnecting);
            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::info!(
                session_id = %self.session_id,
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "reconnecting"
            );

            // Keep absorbing outbound envelopes into the outbox while we
            // wait out the back-off delay.
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = shutdown.cancelled() => {
                        self.set_state(ChannelState::Disconnected);
                        return Err(ChannelError::Shutdown);
                    }
                    maybe = outbound.recv(), if producer_open => match maybe {
                        Some(envelope) => self.queue_offline(&mut outbox, envelope),
                        None => producer_open = false,
                    },
                }
            }

            attempt += 1;
        }
    }

    /// Same as [`run`](Self::run), but returns a `JoinHandle` for embedding
    /// in a larger runtime.
    pub fn spawn(
        self,
        outbound: mpsc::Receiver<Envelope>,
        inbound: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), ChannelError>> {
        tokio::spawn(async move { self.run(outbound, inbound, shutdown).await })
    }

    // ── Single connection lifecycle ──────────────────────────────────

    /// Connect → handshake → flush outbox → message loop.
    ///
    /// Returns `Ok(true)` if the handshake completed before the connection
    /// closed, `Ok(false)` if it closed earlier.  `HandshakeRejected` is
    /// terminal; every other error triggers a reconnect.
    async fn connect_and_run(
        &self,
        outbound: &mut mpsc::Receiver<Envelope>,
        inbound: &mpsc::Sender<Envelope>,
        outbox: &mut Outbox,
        producer_open: &mut bool,
    ) -> Result<bool, ChannelError> {
        tracing::info!(
            url = %self.gateway_ws_url,
            session_id = %self.session_id,
            "connecting to gateway"
        );

        let (ws, _response) = tokio_tungstenite::connect_async(&self.gateway_ws_url)
            .await
            .map_err(|e| ChannelError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // ── Signed handshake ─────────────────────────────────────────
        let request = HandshakeRequestPayload {
            protocol_version: PROTOCOL_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").into(),
            capabilities: self.capabilities.clone(),
        };
        let mut envelope = Envelope::new(
            EnvelopeKind::HandshakeRequest,
            serde_json::to_value(&request).map_err(anyhow::Error::from)?,
            self.session_id.clone(),
            self.origin.clone(),
        );
        self.sign(&mut envelope);
        let json = serde_json::to_string(&envelope).map_err(anyhow::Error::from)?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| ChannelError::WebSocket(e.to_string()))?;
        self.set_state(ChannelState::HandshakeSent);

        let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(Ok(msg)) = stream.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                        if envelope.kind == EnvelopeKind::HandshakeResponse {
                            return Some(envelope);
                        }
                    }
                }
            }
            None
        })
        .await;

        let response = match response {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                return Err(ChannelError::WebSocket(
                    "connection closed before handshake response".into(),
                ))
            }
            Err(_) => return Err(ChannelError::WebSocket("handshake response timeout".into())),
        };

        if !self.keys.verify(&response.signing_base(), &response.signature) {
            return Err(ChannelError::WebSocket(
                "handshake response signature invalid".into(),
            ));
        }
        let payload: HandshakeResponsePayload = response
            .typed_payload()
            .map_err(|e| ChannelError::WebSocket(format!("malformed handshake response: {e}")))?;
        if payload.session_id != self.session_id {
            return Err(ChannelError::WebSocket(format!(
                "handshake response for wrong session: {}",
                payload.session_id
            )));
        }
        if payload.status != HandshakeStatus::Accepted {
            return Err(ChannelError::HandshakeRejected(payload.session_id));
        }

        self.set_state(ChannelState::Connected);
        tracing::info!(session_id = %self.session_id, "handshake accepted");

        // ── Flush the offline outbox, oldest first ───────────────────
        self.flush_outbox(&mut sink, outbox).await?;

        // ── Message loop with heartbeat ──────────────────────────────
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;
        let mut unacked: u32 = 0;

        loop {
            tokio::select! {
                maybe = outbound.recv(), if *producer_open => match maybe {
                    Some(envelope) => {
                        if let Err(e) = self.send_signed(&mut sink, envelope.clone()).await {
                            self.queue_offline(outbox, envelope);
                            return Err(e);
                        }
                    }
                    None => *producer_open = false,
                },
                _ = heartbeat.tick() => {
                    if unacked >= self.config.heartbeat_failure_limit {
                        return Err(ChannelError::WebSocket(format!(
                            "{unacked} consecutive heartbeats unanswered"
                        )));
                    }
                    let envelope = Envelope::new(
                        EnvelopeKind::Heartbeat,
                        serde_json::to_value(HeartbeatPayload {
                            sent_at: Utc::now().timestamp_millis(),
                        })
                        .map_err(anyhow::Error::from)?,
                        self.session_id.clone(),
                        self.origin.clone(),
                    );
                    self.send_signed(&mut sink, envelope).await?;
                    unacked += 1;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) if envelope.kind == EnvelopeKind::Heartbeat => {
                                unacked = 0;
                            }
                            Ok(envelope) => {
                                if inbound.send(envelope).await.is_err() {
                                    tracing::debug!("inbound consumer gone, dropping envelope");
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "failed to parse inbound message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(session_id = %self.session_id, "gateway closed connection");
                        return Ok(true);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(ChannelError::WebSocket(e.to_string()));
                    }
                },
            }
        }
    }

    // ── Private ──────────────────────────────────────────────────────

    /// Flush queued envelopes oldest first, signing each at send time.
    /// A transport failure mid-flush puts the failing envelope and the
    /// entire unsent remainder back into the outbox so the next connection
    /// retries them in order.
    async fn flush_outbox<S>(&self, sink: &mut S, outbox: &mut Outbox) -> Result<(), ChannelError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let max_age = Duration::from_secs(self.config.message_timeout_secs);
        let mut pending = outbox.drain_fresh(Utc::now(), max_age).into_iter();
        while let Some(envelope) = pending.next() {
            if let Err(e) = self.send_signed(sink, envelope.clone()).await {
                self.queue_offline(outbox, envelope);
                for unsent in pending {
                    self.queue_offline(outbox, unsent);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Sign with the then-current key and transmit.
    async fn send_signed<S>(&self, sink: &mut S, mut envelope: Envelope) -> Result<(), ChannelError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        self.sign(&mut envelope);
        let json = serde_json::to_string(&envelope).map_err(anyhow::Error::from)?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| ChannelError::WebSocket(e.to_string()))
    }

    fn sign(&self, envelope: &mut Envelope) {
        envelope.signature = self.keys.sign(&envelope.signing_base());
    }

    fn queue_offline(&self, outbox: &mut Outbox, envelope: Envelope) {
        if let Some(evicted) = outbox.push(envelope) {
            tracing::warn!(
                session_id = %self.session_id,
                kind = %evicted.kind,
                "outbox full, dropped oldest queued envelope"
            );
        }
    }

    fn set_state(&self, state: ChannelState) {
        let _ = self.state_tx.send(state);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
