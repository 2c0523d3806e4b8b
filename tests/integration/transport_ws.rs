//! Integration tests for the websocket transport
//!
//! Runs the real adapter against an axum websocket route on an ephemeral
//! port.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chat_stream::model::ConversationId;
use chat_stream::protocol::ClientAction;
use chat_stream::transport::{Transport, TransportError, TransportSignal, WebSocketTransport};
use tokio::sync::mpsc;

use super::common::frames;

#[derive(Debug)]
enum Seen {
    Auth(Option<String>),
    Text(String),
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(seen): State<mpsc::UnboundedSender<Seen>>,
) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let _ = seen.send(Seen::Auth(auth));
    ws.on_upgrade(move |socket| serve(socket, seen))
}

/// Send one event, echo the first client frame to the test, then close.
async fn serve(mut socket: WebSocket, seen: mpsc::UnboundedSender<Seen>) {
    let _ = socket
        .send(Message::Text(frames::message_start("m1", "ai").into()))
        .await;
    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Text(text) = message {
            let _ = seen.send(Seen::Text(text.as_str().to_string()));
            break;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn denied() -> impl IntoResponse {
    StatusCode::UNAUTHORIZED
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/ws", get(upgrade))
        .route("/denied", get(denied))
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}"), rx)
}

async fn next_signal(rx: &mut mpsc::Receiver<TransportSignal>) -> TransportSignal {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}

/// Frames flow both ways and a server close is reported as a loss
#[tokio::test]
async fn test_websocket_round_trip_and_server_close() {
    let (base, mut seen) = spawn_server().await;
    let mut transport = WebSocketTransport::new(Duration::from_secs(30), 16);

    let mut signals = transport
        .connect(&format!("{base}/ws"), "secret")
        .await
        .unwrap();
    assert!(transport.is_connected());
    match seen.recv().await {
        Some(Seen::Auth(auth)) => assert_eq!(auth.as_deref(), Some("Bearer secret")),
        other => panic!("Expected auth header, got {:?}", other),
    }

    assert_eq!(next_signal(&mut signals).await, TransportSignal::Opened);
    match next_signal(&mut signals).await {
        TransportSignal::Frame(raw) => assert!(raw.contains("message_start")),
        other => panic!("Expected frame, got {:?}", other),
    }

    let action = ClientAction::StopStream {
        conversation_id: ConversationId::from("c1"),
    };
    transport.send(&action).await.unwrap();
    match seen.recv().await {
        Some(Seen::Text(text)) => {
            let echoed: ClientAction = serde_json::from_str(&text).unwrap();
            assert_eq!(echoed, action);
        }
        other => panic!("Expected client frame, got {:?}", other),
    }

    assert!(matches!(
        next_signal(&mut signals).await,
        TransportSignal::Lost { .. }
    ));
    assert!(!transport.is_connected());
    assert_eq!(
        transport.send(&action).await,
        Err(TransportError::Closed)
    );
}

/// Rejected upgrade surfaces as Unauthorized, not a retryable failure
#[tokio::test]
async fn test_websocket_rejected_token() {
    let (base, _seen) = spawn_server().await;
    let mut transport = WebSocketTransport::new(Duration::from_secs(30), 16);

    let err = transport
        .connect(&format!("{base}/denied"), "stale")
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Unauthorized);
    assert!(!err.is_retryable());
}

/// A client close does not produce a loss signal
#[tokio::test]
async fn test_websocket_client_close_is_silent() {
    let (base, _seen) = spawn_server().await;
    let mut transport = WebSocketTransport::new(Duration::from_secs(30), 16);
    let mut signals = transport
        .connect(&format!("{base}/ws"), "secret")
        .await
        .unwrap();
    assert_eq!(next_signal(&mut signals).await, TransportSignal::Opened);

    transport.close().await;
    assert!(!transport.is_connected());

    let rest = tokio::time::timeout(Duration::from_millis(200), async {
        let mut lost = false;
        while let Some(signal) = signals.recv().await {
            lost |= matches!(signal, TransportSignal::Lost { .. });
        }
        lost
    })
    .await
    .unwrap_or(false);
    assert!(!rest);
}
