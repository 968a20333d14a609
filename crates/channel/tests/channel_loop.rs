//! Integration test: boots an in-process WebSocket server that simulates
//! the gateway side of the channel protocol, connects a real
//! [`SecureChannel`], and asserts the full lifecycle:
//!
//! - the handshake request is signed and carries the right session id
//! - an accepted handshake response moves the channel to `Connected`
//! - outbound envelopes arrive signed, in order
//! - a dropped connection triggers reconnection, and envelopes queued
//!   while offline flush in order, exactly once, after the new handshake
//! - a rejected handshake is terminal
//! - shutdown cancels a pending reconnect

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use fg_channel::{ChannelError, ChannelState, SecureChannel};
use fg_domain::config::ChannelConfig;
use fg_protocol::{Envelope, EnvelopeKind, HandshakeResponsePayload, HandshakeStatus};
use fg_security::KeyManager;

const SESSION: &str = "sess-test";
const ORIGIN: &str = "https://school.instructure.com";

fn fast_config() -> ChannelConfig {
    ChannelConfig {
        heartbeat_interval_secs: 1,
        heartbeat_failure_limit: 3,
        message_timeout_secs: 30,
        outbox_capacity: 16,
        reconnect_initial_ms: 50,
        reconnect_max_ms: 200,
        reconnect_max_attempts: 20,
    }
}

fn signal(tag: &str) -> Envelope {
    Envelope::new(
        EnvelopeKind::BehavioralSignal,
        serde_json::json!({ "tag": tag }),
        SESSION,
        ORIGIN,
    )
}

// ── Mini gateway: in-process WS server ──────────────────────────────────

type ServerWs = WebSocketStream<TcpStream>;

async fn bind() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, listener)
}

/// Accept one connection, consume its handshake request (verifying the
/// signature), and answer with the given status. Returns the open socket.
async fn accept_and_answer(
    listener: &TcpListener,
    keys: &KeyManager,
    status: HandshakeStatus,
) -> ServerWs {
    let (stream, _peer) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    let request = next_envelope(&mut ws).await;
    assert_eq!(request.kind, EnvelopeKind::HandshakeRequest);
    assert_eq!(request.session_id, SESSION);
    assert!(keys.verify(&request.signing_base(), &request.signature));

    let mut response = Envelope::new(
        EnvelopeKind::HandshakeResponse,
        serde_json::to_value(HandshakeResponsePayload {
            session_id: SESSION.into(),
            status,
        })
        .unwrap(),
        SESSION,
        "http://gateway.local",
    );
    response.signature = keys.sign(&response.signing_base());
    ws.send(Message::Text(serde_json::to_string(&response).unwrap()))
        .await
        .unwrap();
    ws
}

/// Read the next text frame and parse it as an envelope.
async fn next_envelope(ws: &mut ServerWs) -> Envelope {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Envelope>(&text).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended while awaiting envelope: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

/// Read envelopes until `count` behavioral signals have arrived, skipping
/// heartbeats.
async fn collect_signals(ws: &mut ServerWs, count: usize) -> Vec<Envelope> {
    let mut signals = Vec::new();
    while signals.len() < count {
        let envelope = next_envelope(ws).await;
        if envelope.kind == EnvelopeKind::BehavioralSignal {
            signals.push(envelope);
        }
    }
    signals
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_then_signed_signals_in_order() {
    let (addr, listener) = bind().await;
    let keys = Arc::new(KeyManager::new(3600, 7200));

    let channel = SecureChannel::new(
        format!("ws://{addr}"),
        SESSION,
        ORIGIN,
        keys.clone(),
        fast_config(),
    );
    let mut state = channel.state();

    let (out_tx, out_rx) = mpsc::channel(16);
    let (in_tx, _in_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let handle = channel.spawn(out_rx, in_tx, shutdown.clone());

    let mut ws = accept_and_answer(&listener, &keys, HandshakeStatus::Accepted).await;
    state
        .wait_for(|s| *s == ChannelState::Connected)
        .await
        .unwrap();

    out_tx.send(signal("first")).await.unwrap();
    out_tx.send(signal("second")).await.unwrap();

    let signals = collect_signals(&mut ws, 2).await;
    assert_eq!(signals[0].payload["tag"], "first");
    assert_eq!(signals[1].payload["tag"], "second");
    for envelope in &signals {
        // Signed at send time with the shared ring.
        assert!(keys.verify(&envelope.signing_base(), &envelope.signature));
    }

    shutdown.cancel();
    assert!(matches!(
        handle.await.unwrap(),
        Err(ChannelError::Shutdown)
    ));
}

#[tokio::test]
async fn offline_envelopes_flush_once_in_order_after_reconnect() {
    let (addr, listener) = bind().await;
    let keys = Arc::new(KeyManager::new(3600, 7200));

    let channel = SecureChannel::new(
        format!("ws://{addr}"),
        SESSION,
        ORIGIN,
        keys.clone(),
        fast_config(),
    );
    let mut state = channel.state();

    let (out_tx, out_rx) = mpsc::channel(16);
    let (in_tx, _in_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let handle = channel.spawn(out_rx, in_tx, shutdown.clone());

    // First connection: handshake, then the gateway hangs up.
    let mut ws = accept_and_answer(&listener, &keys, HandshakeStatus::Accepted).await;
    state
        .wait_for(|s| *s == ChannelState::Connected)
        .await
        .unwrap();
    ws.close(None).await.unwrap();
    drop(ws);

    state
        .wait_for(|s| *s == ChannelState::Reconnecting)
        .await
        .unwrap();
    out_tx.send(signal("queued-1")).await.unwrap();
    out_tx.send(signal("queued-2")).await.unwrap();

    // Second connection: the queued envelopes arrive after the handshake,
    // oldest first, exactly once.
    let mut ws = accept_and_answer(&listener, &keys, HandshakeStatus::Accepted).await;
    let signals = collect_signals(&mut ws, 2).await;
    assert_eq!(signals[0].payload["tag"], "queued-1");
    assert_eq!(signals[1].payload["tag"], "queued-2");
    assert!(signals.iter().all(|e| keys
        .verify(&e.signing_base(), &e.signature)));

    // Nothing else queued: send one live to prove the stream moved on.
    out_tx.send(signal("live")).await.unwrap();
    let live = collect_signals(&mut ws, 1).await;
    assert_eq!(live[0].payload["tag"], "live");

    shutdown.cancel();
    assert!(matches!(
        handle.await.unwrap(),
        Err(ChannelError::Shutdown)
    ));
}

#[tokio::test]
async fn rejected_handshake_is_terminal() {
    let (addr, listener) = bind().await;
    let keys = Arc::new(KeyManager::new(3600, 7200));

    let channel = SecureChannel::new(
        format!("ws://{addr}"),
        SESSION,
        ORIGIN,
        keys.clone(),
        fast_config(),
    );

    let (_out_tx, out_rx) = mpsc::channel::<Envelope>(4);
    let (in_tx, _in_rx) = mpsc::channel(4);
    let handle = channel.spawn(out_rx, in_tx, CancellationToken::new());

    let _ws = accept_and_answer(&listener, &keys, HandshakeStatus::Rejected).await;

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ChannelError::HandshakeRejected(_))));
}

#[tokio::test]
async fn shutdown_cancels_pending_reconnect() {
    // Bind then drop the listener so every connect attempt fails fast.
    let (addr, listener) = bind().await;
    drop(listener);

    let keys = Arc::new(KeyManager::new(3600, 7200));
    let mut config = fast_config();
    config.reconnect_initial_ms = 10_000;
    let channel = SecureChannel::new(format!("ws://{addr}"), SESSION, ORIGIN, keys, config);

    let (_out_tx, out_rx) = mpsc::channel::<Envelope>(4);
    let (in_tx, _in_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();
    let handle = channel.spawn(out_rx, in_tx, shutdown.clone());

    // Give the first connect attempt time to fail and enter the back-off
    // sleep, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ChannelError::Shutdown)));
}
