//! WebSocket ingest for the embedded page's secure channel.
//!
//! Flow:
//! 1. Page connects to `/v1/channel/ws` and sends a signed
//!    `handshake_request` envelope.
//! 2. The envelope runs through the full validation pipeline; the gateway
//!    answers with a signed `handshake_response` (accepted or rejected).
//! 3. Message loop: every inbound envelope is validated; accepted ones are
//!    routed to the session actor, heartbeats are answered, rejections get
//!    a signed error notice and are audited by the validator.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use fg_domain::AuditEvent;
use fg_protocol::{
    Envelope, EnvelopeKind, HandshakeResponsePayload, HandshakeStatus, HeartbeatPayload,
    NavigationPayload, PageContextPayload,
};
use fg_sessions::SessionHandle;

use crate::state::AppState;

/// Origin stamped on gateway-signed envelopes (responses and notices).
const GATEWAY_ORIGIN: &str = "framegate://gateway";

const HANDSHAKE_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

/// GET /v1/channel/ws — upgrade to WebSocket. No bearer token: each
/// envelope authenticates itself via origin + signature + nonce.
pub async fn channel_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // 1. Wait for the handshake request.
    let request = match wait_for_handshake(&mut stream).await {
        Some(envelope) => envelope,
        None => {
            tracing::warn!("channel closed before sending handshake_request");
            return;
        }
    };

    // 2. Full validation, same pipeline as every other envelope.
    let verdict = state.validator.validate(&request);
    let session_id = request.session_id.clone();
    let accepted = verdict.valid;

    AuditEvent::HandshakeCompleted {
        session_id: session_id.clone(),
        origin: request.origin.clone(),
        accepted,
    }
    .emit();

    let response = signed(
        &state,
        EnvelopeKind::HandshakeResponse,
        serde_json::json!(HandshakeResponsePayload {
            session_id: session_id.clone(),
            status: if accepted {
                HandshakeStatus::Accepted
            } else {
                HandshakeStatus::Rejected
            },
        }),
        &session_id,
    );
    if send_envelope(&mut sink, &response).await.is_err() {
        return;
    }
    if !accepted {
        tracing::warn!(
            session_id = %session_id,
            reasons = ?verdict.failures,
            "handshake rejected"
        );
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let handle = state.sessions.handle(&session_id);
    tracing::info!(
        session_id = %session_id,
        origin = %request.origin,
        "channel connected"
    );

    // 3. Writer task: forwards gateway-signed envelopes to the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            if send_envelope(&mut sink, &envelope).await.is_err() {
                break;
            }
        }
    });

    // 4. Reader loop.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let envelope = match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, error = %e, "unparseable frame");
                        continue;
                    }
                };

                let verdict = state.validator.validate(&envelope);
                if !verdict.valid {
                    let notice = signed(
                        &state,
                        EnvelopeKind::Intervention,
                        serde_json::json!({
                            "kind": "validation_rejected",
                            "reasons": verdict.failures.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
                            "retryable": verdict.is_retryable(),
                        }),
                        &session_id,
                    );
                    let _ = out_tx.send(notice).await;
                    continue;
                }

                route(&state, &handle, envelope, &out_tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    tracing::info!(session_id = %session_id, "channel disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch one accepted envelope to the session actor.
async fn route(
    state: &AppState,
    handle: &SessionHandle,
    envelope: Envelope,
    out_tx: &mpsc::Sender<Envelope>,
) {
    let result = match envelope.kind {
        EnvelopeKind::Heartbeat => {
            let answer = signed(
                state,
                EnvelopeKind::Heartbeat,
                serde_json::json!(HeartbeatPayload {
                    sent_at: chrono::Utc::now().timestamp_millis(),
                }),
                handle.session_id(),
            );
            let _ = out_tx.send(answer).await;
            return;
        }
        EnvelopeKind::PageContextUpdate => match envelope.typed_payload::<PageContextPayload>() {
            Ok(payload) => handle
                .update_context(Some(payload.student_id), payload.current_content)
                .await
                .map(|_| ()),
            Err(e) => Err(fg_domain::Error::Structural(format!(
                "malformed page_context_update payload: {e}"
            ))),
        },
        EnvelopeKind::BehavioralSignal => {
            // Navigation events travel as behavioral signals; anything
            // else is forwarded to observers untouched.
            match envelope.typed_payload::<NavigationPayload>() {
                Ok(nav) if !nav.content_id.is_empty() => {
                    handle.record_navigation(nav).await.map(|_| ())
                }
                _ => {
                    handle
                        .forward_signal(envelope.kind.as_str().to_owned(), envelope.payload)
                        .await
                }
            }
        }
        EnvelopeKind::ContentExtraction => {
            handle
                .forward_signal(envelope.kind.as_str().to_owned(), envelope.payload)
                .await
        }
        // Gateway-originated kinds have no business arriving inbound.
        EnvelopeKind::HandshakeRequest
        | EnvelopeKind::HandshakeResponse
        | EnvelopeKind::Intervention => {
            tracing::debug!(
                session_id = %handle.session_id(),
                kind = %envelope.kind,
                "ignoring unexpected inbound envelope kind"
            );
            return;
        }
    };

    if let Err(e) = result {
        tracing::warn!(
            session_id = %handle.session_id(),
            error = %e,
            "failed to apply accepted envelope"
        );
        let notice = signed(
            state,
            EnvelopeKind::Intervention,
            serde_json::json!({
                "kind": "operation_failed",
                "error": e.to_string(),
                "retryable": e.is_retryable(),
            }),
            handle.session_id(),
        );
        let _ = out_tx.send(notice).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_handshake(stream: &mut SplitStream<WebSocket>) -> Option<Envelope> {
    let timeout = tokio::time::timeout(HANDSHAKE_WAIT, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                    if envelope.kind == EnvelopeKind::HandshakeRequest {
                        return Some(envelope);
                    }
                }
            }
        }
        None
    })
    .await;

    timeout.unwrap_or(None)
}

/// Build a gateway envelope signed with the current key.
fn signed(
    state: &AppState,
    kind: EnvelopeKind,
    payload: serde_json::Value,
    session_id: &str,
) -> Envelope {
    let mut envelope = Envelope::new(kind, payload, session_id, GATEWAY_ORIGIN);
    envelope.signature = state.keys.sign(&envelope.signing_base());
    envelope
}

async fn send_envelope(
    sink: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}
