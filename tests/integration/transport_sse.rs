//! Integration tests for the server-sent events transport
//!
//! The fake backend serves an event stream and the per-conversation
//! action endpoint from one axum router.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chat_stream::model::ConversationId;
use chat_stream::protocol::{ClientAction, EventDecoder, ServerEvent};
use chat_stream::transport::{SseTransport, Transport, TransportError, TransportSignal};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::common::frames;

#[derive(Debug)]
struct PostedAction {
    conversation_id: String,
    auth: Option<String>,
    body: Value,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn opening_events() -> impl Stream<Item = Result<Event, Infallible>> {
    stream::iter(vec![
        Ok(Event::default()
            .event("message_start")
            .data(json!({ "messageId": "m1", "role": "ai" }).to_string())),
        Ok(Event::default().data(frames::message_delta("m1", "hello"))),
    ])
}

/// Stays open after the opening events.
async fn live_stream() -> impl IntoResponse {
    Sse::new(opening_events().chain(stream::pending()))
}

/// Ends right after the opening events.
async fn short_stream() -> impl IntoResponse {
    Sse::new(opening_events())
}

async fn denied() -> impl IntoResponse {
    StatusCode::UNAUTHORIZED
}

async fn post_action(
    Path(id): Path<String>,
    State(posted): State<mpsc::UnboundedSender<PostedAction>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let _ = posted.send(PostedAction {
        conversation_id: id,
        auth: bearer(&headers),
        body,
    });
    StatusCode::ACCEPTED
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<PostedAction>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/events", get(live_stream))
        .route("/short", get(short_stream))
        .route("/denied", get(denied))
        .route("/conversations/{id}/actions", post(post_action))
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), rx)
}

async fn next_signal(rx: &mut mpsc::Receiver<TransportSignal>) -> TransportSignal {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}

/// Named events keep their name; unnamed ones carry the whole frame
#[tokio::test]
async fn test_sse_named_and_plain_frames() {
    let (base, _posted) = spawn_server().await;
    let mut transport = SseTransport::new(base.clone(), 16);
    let mut signals = transport
        .connect(&format!("{base}/events"), "secret")
        .await
        .unwrap();
    assert!(transport.is_connected());
    assert_eq!(next_signal(&mut signals).await, TransportSignal::Opened);

    let mut decoder = EventDecoder::new();
    match next_signal(&mut signals).await {
        TransportSignal::NamedFrame { event, data } => {
            assert_eq!(event, "message_start");
            let envelope = decoder.decode_named(&event, &data).unwrap().unwrap();
            assert!(matches!(envelope.event, ServerEvent::MessageStart(_)));
        }
        other => panic!("Expected named frame, got {:?}", other),
    }
    match next_signal(&mut signals).await {
        TransportSignal::Frame(raw) => {
            let envelope = decoder.decode(&raw).unwrap().unwrap();
            assert!(matches!(envelope.event, ServerEvent::MessageDelta(_)));
        }
        other => panic!("Expected plain frame, got {:?}", other),
    }

    transport.close().await;
    assert!(!transport.is_connected());
}

/// Client actions go out as authenticated POSTs addressed by conversation
#[tokio::test]
async fn test_sse_actions_are_posted() {
    let (base, mut posted) = spawn_server().await;
    let mut transport = SseTransport::new(format!("{base}/"), 16);

    let action = ClientAction::SendMessage {
        conversation_id: ConversationId::from("c7"),
        message_id: "client-1".into(),
        content: "hi".into(),
    };
    // Nothing to authenticate with before the stream opens.
    assert_eq!(transport.send(&action).await, Err(TransportError::Closed));

    let _signals = transport
        .connect(&format!("{base}/events"), "secret")
        .await
        .unwrap();
    transport.send(&action).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), posted.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.conversation_id, "c7");
    assert_eq!(received.auth.as_deref(), Some("Bearer secret"));
    assert_eq!(received.body["type"], "send_message");
    assert_eq!(received.body["content"], "hi");
    assert_eq!(received.body["messageId"], "client-1");
}

/// Server ending the stream is a loss, after the buffered frames
#[tokio::test]
async fn test_sse_stream_end_is_lost() {
    let (base, _posted) = spawn_server().await;
    let mut transport = SseTransport::new(base.clone(), 16);
    let mut signals = transport
        .connect(&format!("{base}/short"), "secret")
        .await
        .unwrap();

    assert_eq!(next_signal(&mut signals).await, TransportSignal::Opened);
    assert!(matches!(
        next_signal(&mut signals).await,
        TransportSignal::NamedFrame { .. }
    ));
    assert!(matches!(
        next_signal(&mut signals).await,
        TransportSignal::Frame(_)
    ));
    assert!(matches!(
        next_signal(&mut signals).await,
        TransportSignal::Lost { .. }
    ));
}

#[tokio::test]
async fn test_sse_rejected_token() {
    let (base, _posted) = spawn_server().await;
    let mut transport = SseTransport::new(base.clone(), 16);
    let err = transport
        .connect(&format!("{base}/denied"), "stale")
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Unauthorized);
}
