//! WebSocket subscription to a session actor's broadcast events.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;

use fg_sessions::{SessionEvent, SessionHandle};

use crate::api::{api_error, context::SessionParams};
use crate::state::AppState;

/// GET /v1/session/events?session_id= — upgrade to WebSocket and stream
/// every actor broadcast (context updates, navigation, assessment changes,
/// forwarded signals, session end) as JSON text frames.
pub async fn session_events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Response {
    let handle = match state.sessions.existing(&params.session_id) {
        Some(handle) => handle,
        None => return api_error(StatusCode::NOT_FOUND, "unknown session"),
    };
    let buffer = state.config.sessions.observer_buffer.max(1);
    ws.on_upgrade(move |socket| stream_events(socket, handle, buffer))
        .into_response()
}

async fn stream_events(mut socket: WebSocket, handle: SessionHandle, buffer: usize) {
    let (tx, mut rx) = mpsc::channel::<SessionEvent>(buffer);
    if handle.attach(tx).await.is_err() {
        // Actor retired between lookup and attach.
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    tracing::debug!(session_id = %handle.session_id(), "event observer attached");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let ended = matches!(event, SessionEvent::SessionEnded { .. });
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to serialize session event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                    if ended {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
                // Actor gone; the observer channel closed.
                None => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                // Subscribers are read-only; ignore anything they send.
                _ => {}
            },
        }
    }

    tracing::debug!(session_id = %handle.session_id(), "event observer detached");
}
