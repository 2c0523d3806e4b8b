//! Integration tests for the session flow
//!
//! Tests the flow: MockTransport frames -> SessionController -> snapshots
//! and session events, driven through the public `SessionHandle`.

use chat_stream::model::{
    ConversationId, Decision, MessageStatus, ResumeRequest, Role, ToolCallStatus,
};
use chat_stream::protocol::{ClientAction, WireMessage};
use chat_stream::session::{
    ConversationSnapshot, ErrorKind, SessionError, SessionEvent, SessionState,
};
use chat_stream::transport::{MockConfig, TransportError};

use super::common::frames;
use super::common::{mock_session, mock_session_with, test_config, wait_for, FakeConversationApi};

fn assistant_turns(snapshot: &ConversationSnapshot) -> Vec<&chat_stream::model::Turn> {
    snapshot
        .turns
        .iter()
        .filter(|t| t.message.role == Role::Assistant)
        .collect()
}

/// A streamed turn with one tool call ends with the call completed
#[tokio::test]
async fn test_tool_call_turn_completes() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;

    s.handle.send_message("search for it").await.unwrap();
    s.push(&[
        frames::message_start("m1", "ai"),
        frames::tool_call_start("t1", "search"),
        frames::tool_call_result("t1", "ok"),
        frames::done(),
    ])
    .await;
    wait_for(&mut s.events, |e| matches!(e, SessionEvent::TurnCompleted { .. })).await;

    let snapshot = s.snapshot().await;
    assert_eq!(snapshot.state, SessionState::IDLE);
    let assistant = assistant_turns(&snapshot);
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].message.id, "m1");
    assert_eq!(assistant[0].tool_calls.len(), 1);
    assert_eq!(assistant[0].tool_calls[0].status, ToolCallStatus::Completed);
    assert_eq!(assistant[0].tool_calls[0].result.as_deref(), Some("ok"));
}

/// Interrupt marks the pending call, approval resumes it
#[tokio::test]
async fn test_interrupt_then_approve() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;

    s.handle.send_message("delete a.txt").await.unwrap();
    s.push(&[
        frames::message_start("m1", "ai"),
        frames::tool_call_start("t1", "delete_file"),
        frames::interrupt("i1", &["delete_file"]),
    ])
    .await;
    let raised = wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::InterruptRaised { .. })
    })
    .await;
    match raised {
        SessionEvent::InterruptRaised { request, .. } => {
            assert_eq!(request.id, "i1");
            assert_eq!(request.action_requests[0].name, "delete_file");
        }
        other => panic!("Expected InterruptRaised, got {:?}", other),
    }

    let snapshot = s.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Interrupted);
    assert_eq!(
        assistant_turns(&snapshot)[0].tool_calls[0].status,
        ToolCallStatus::Interrupted
    );
    assert!(matches!(
        s.handle.send_message("another").await,
        Err(SessionError::InterruptPending)
    ));

    s.handle
        .resume_interrupt(ResumeRequest::approve_all())
        .await
        .unwrap();
    assert_eq!(s.state().await, SessionState::STREAMING);
    match s.remote.sent_actions().last() {
        Some(ClientAction::ResumeInterrupt {
            interrupt_id,
            decisions,
            ..
        }) => {
            assert_eq!(interrupt_id, "i1");
            assert_eq!(decisions, &vec![Decision::Approve]);
        }
        other => panic!("Expected ResumeInterrupt, got {:?}", other),
    }
    assert!(matches!(
        s.handle.resume_interrupt(ResumeRequest::approve_all()).await,
        Err(SessionError::ResumeAlreadyPending { .. })
    ));

    s.push(&[frames::tool_call_result("t1", "deleted"), frames::done()])
        .await;
    wait_for(&mut s.events, |e| matches!(e, SessionEvent::TurnCompleted { .. })).await;

    let snapshot = s.snapshot().await;
    assert!(snapshot.interrupt.is_none());
    let call = &assistant_turns(&snapshot)[0].tool_calls[0];
    assert_eq!(call.status, ToolCallStatus::Completed);
    assert_eq!(call.result.as_deref(), Some("deleted"));
}

/// A result for a call that never started is dropped without harm
#[tokio::test]
async fn test_unmatched_tool_result_is_dropped() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;

    s.handle.send_message("hi").await.unwrap();
    s.push(&[
        frames::tool_call_result("ghost", "boo"),
        frames::message_start("m1", "ai"),
        frames::message_delta("m1", "hello"),
        frames::done(),
    ])
    .await;
    wait_for(&mut s.events, |e| matches!(e, SessionEvent::TurnCompleted { .. })).await;

    let snapshot = s.snapshot().await;
    assert_eq!(snapshot.state, SessionState::IDLE);
    assert!(snapshot.turns.iter().all(|t| t.tool_calls.is_empty()));
    assert_eq!(assistant_turns(&snapshot)[0].message.content.text(), "hello");
}

/// The server's echo of the user message replaces the optimistic one
#[tokio::test]
async fn test_optimistic_message_confirmed_without_duplicate() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;

    let client_id = s.handle.send_message("hello").await.unwrap();
    assert!(client_id.starts_with("local-"));
    let pending = s.snapshot().await;
    assert!(pending.send_pending);
    assert_eq!(pending.turns.len(), 1);

    s.push(&[
        frames::message_start("u-1", "human"),
        frames::message_start("m1", "ai"),
        frames::message_delta("m1", "hi there"),
        frames::done(),
    ])
    .await;
    wait_for(&mut s.events, |e| matches!(e, SessionEvent::TurnCompleted { .. })).await;

    let snapshot = s.snapshot().await;
    assert!(!snapshot.send_pending);
    let users: Vec<_> = snapshot
        .turns
        .iter()
        .filter(|t| t.message.role == Role::User)
        .collect();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].message.id, "u-1");
    assert_eq!(users[0].message.status, MessageStatus::Final);
    assert_eq!(snapshot.turns[0].message.id, "u-1", "kept its position");
}

/// A failed send removes the optimistic message and reports it
#[tokio::test]
async fn test_failed_send_rolls_back() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;
    s.handle.create_conversation(None).await.unwrap();

    s.remote.fail_next_send(TransportError::Closed);
    let err = s.handle.send_message("lost").await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(TransportError::Closed)));

    let failed = wait_for(&mut s.events, |e| matches!(e, SessionEvent::SendFailed { .. })).await;
    match failed {
        SessionEvent::SendFailed { text, .. } => assert_eq!(text, "lost"),
        other => panic!("Expected SendFailed, got {:?}", other),
    }
    let snapshot = s.snapshot().await;
    assert!(snapshot.turns.is_empty());
    assert!(!snapshot.send_pending);
}

/// Stop goes idle right away even when the server never answers
#[tokio::test]
async fn test_stop_is_immediate_with_unresponsive_server() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;

    s.handle.send_message("write a novel").await.unwrap();
    s.push(&[
        frames::message_start("m1", "ai"),
        frames::message_delta("m1", "Chapter one"),
    ])
    .await;
    s.snapshot_when(|snap| assistant_turns(snap).len() == 1).await;

    s.remote.set_hanging_sends(true);
    tokio::time::timeout(std::time::Duration::from_millis(20), s.handle.stop_stream())
        .await
        .expect("stop resolved without waiting on the server")
        .unwrap();

    let snapshot = s.snapshot().await;
    assert_eq!(snapshot.state, SessionState::IDLE);
    let partial = &assistant_turns(&snapshot)[0].message;
    assert_eq!(partial.status, MessageStatus::Incomplete);
    assert_eq!(partial.content.text(), "Chapter one");
    assert!(matches!(
        s.remote.sent_actions().last(),
        Some(ClientAction::StopStream { .. })
    ));
}

/// Losing the connection mid-stream freezes the partial reply; the
/// reconnect continues the same conversation without refetching history
#[tokio::test]
async fn test_reconnect_resumes_without_refetching_history() {
    let api = FakeConversationApi::new().with_history(
        "c1",
        vec![vec![
            WireMessage::new(Role::User, "earlier question").with_id("h1"),
            WireMessage::new(Role::Assistant, "earlier answer").with_id("h2"),
        ]],
    );
    let mut s = mock_session(api);
    s.connect().await;
    s.handle
        .switch_conversation(ConversationId::from("c1"))
        .await
        .unwrap();
    s.snapshot_when(|snap| snap.history_complete && snap.turns.len() == 2)
        .await;
    assert_eq!(s.api.fetch_count("c1"), 1);

    s.handle.send_message("tell me a story").await.unwrap();
    s.push(&[
        frames::message_start("m1", "ai"),
        frames::message_delta("m1", "Once upon"),
    ])
    .await;
    s.remote.drop_connection("connection reset").await;

    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::Disconnected))
    })
    .await;
    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::STREAMING))
    })
    .await;

    assert_eq!(s.remote.connects().len(), 2);
    let actions = s.remote.sent_actions();
    let n = actions.len();
    assert!(matches!(actions[n - 2], ClientAction::Subscribe { .. }));
    assert!(matches!(actions[n - 1], ClientAction::ContinueStream { .. }));

    let frozen = s.snapshot().await;
    let m1 = frozen.turns.iter().find(|t| t.message.id == "m1").unwrap();
    assert_eq!(m1.message.status, MessageStatus::Incomplete);
    assert_eq!(m1.message.content.text(), "Once upon");

    // Server replays the interrupted message from the start.
    s.push(&[
        frames::message_start("m1", "ai"),
        frames::message_delta("m1", "Once upon a time"),
        frames::done(),
    ])
    .await;
    wait_for(&mut s.events, |e| matches!(e, SessionEvent::TurnCompleted { .. })).await;

    let snapshot = s.snapshot().await;
    let replies: Vec<_> = snapshot
        .turns
        .iter()
        .filter(|t| t.message.id == "m1")
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message.content.text(), "Once upon a time");
    assert_eq!(replies[0].message.status, MessageStatus::Final);
    assert_eq!(snapshot.turns.len(), 4);
    assert_eq!(s.api.fetch_count("c1"), 1, "history not fetched again");
}

/// Reconnect attempts are bounded
#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut config = test_config();
    config.reconnect.max_attempts = 2;
    let mut s = mock_session_with(
        FakeConversationApi::new(),
        MockConfig::default().acknowledge_on_connect(),
        config,
    );
    s.connect().await;

    for _ in 0..2 {
        s.remote
            .fail_next_connect(TransportError::Connect("refused".into()));
    }
    s.remote.drop_connection("network down").await;

    let exhausted = wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(exhausted, SessionEvent::ReconnectExhausted { attempts: 2 });
    assert_eq!(s.remote.connects().len(), 3);
    assert_eq!(s.state().await, SessionState::Disconnected);

    s.handle.reconnect().await.unwrap();
    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::StateChanged(state) if state.is_connected())
    })
    .await;
}

/// An unrecoverable server error parks the session until an explicit
/// reconnect
#[tokio::test]
async fn test_auth_error_is_fatal_until_reconnect() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;
    s.handle.create_conversation(None).await.unwrap();

    s.push(&[frames::error("token expired", Some("unauthorized"))])
        .await;
    let error = wait_for(&mut s.events, |e| matches!(e, SessionEvent::ServerError { .. })).await;
    match error {
        SessionEvent::ServerError {
            message,
            code,
            kind,
            ..
        } => {
            assert_eq!(message, "token expired");
            assert_eq!(code.as_deref(), Some("unauthorized"));
            assert_eq!(kind, ErrorKind::Server);
        }
        other => panic!("Expected ServerError, got {:?}", other),
    }
    assert_eq!(s.state().await, SessionState::Error);
    assert!(matches!(
        s.handle.send_message("hello?").await,
        Err(SessionError::NotConnected)
    ));

    s.handle.reconnect().await.unwrap();
    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::Connected(_)))
    })
    .await;
}

/// A server error before the echo rolls the send back and reports both
/// failures by kind
#[tokio::test]
async fn test_server_error_reports_rollback_and_failure_kinds() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;
    s.handle.create_conversation(None).await.unwrap();

    s.handle.send_message("hello").await.unwrap();
    s.push(&[frames::error("model overloaded", None)]).await;

    let failed = wait_for(&mut s.events, |e| matches!(e, SessionEvent::SendFailed { .. })).await;
    match failed {
        SessionEvent::SendFailed {
            text, reason, kind, ..
        } => {
            assert_eq!(text, "hello");
            assert_eq!(reason, "model overloaded");
            assert_eq!(kind, ErrorKind::OptimisticMismatch);
        }
        other => panic!("Expected SendFailed, got {:?}", other),
    }
    let error = wait_for(&mut s.events, |e| matches!(e, SessionEvent::ServerError { .. })).await;
    match error {
        SessionEvent::ServerError {
            message, kind, code, ..
        } => {
            assert_eq!(message, "model overloaded");
            assert_eq!(code, None);
            assert_eq!(kind, ErrorKind::Server);
        }
        other => panic!("Expected ServerError, got {:?}", other),
    }
    assert_eq!(s.state().await, SessionState::IDLE);
    assert!(s.snapshot().await.turns.is_empty());
}

/// Switching away mid-stream stops the old turn, keeps its partial
/// message cached, and late frames for it leave the new conversation alone
#[tokio::test]
async fn test_switch_mid_stream_stops_and_keeps_previous_turn() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;
    let a = s.handle.create_conversation(None).await.unwrap();
    let b = s.handle.create_conversation(None).await.unwrap();
    s.handle.switch_conversation(a.id.clone()).await.unwrap();

    s.handle.send_message("write a story").await.unwrap();
    s.push(&[
        frames::message_start("m1", "ai"),
        frames::message_delta("m1", "Once upon"),
    ])
    .await;
    s.snapshot_when(|snap| {
        assistant_turns(snap)
            .first()
            .is_some_and(|t| t.message.content.text() == "Once upon")
    })
    .await;
    assert_eq!(s.state().await, SessionState::STREAMING);

    s.handle.switch_conversation(b.id.clone()).await.unwrap();
    assert!(s.remote.sent_actions().iter().any(|action| matches!(
        action,
        ClientAction::StopStream { conversation_id } if conversation_id == &a.id
    )));
    assert_eq!(s.state().await, SessionState::IDLE);

    while s.events.try_recv().is_ok() {}
    let id = a.id.as_str();
    s.push(&[
        frames::in_conversation(&frames::message_delta("m1", " a time"), id),
        frames::in_conversation(&frames::done(), id),
    ])
    .await;
    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::ConversationUpdated { conversation_id } if conversation_id == &a.id)
    })
    .await;
    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::ConversationUpdated { conversation_id } if conversation_id == &a.id)
    })
    .await;

    let active = s.snapshot().await;
    assert_eq!(active.conversation.id, b.id);
    assert_eq!(active.state, SessionState::IDLE);
    assert!(active.turns.is_empty());
    assert_eq!(s.state().await, SessionState::IDLE);

    s.handle.switch_conversation(a.id.clone()).await.unwrap();
    let previous = s.snapshot_when(|snap| !assistant_turns(snap).is_empty()).await;
    let turn = assistant_turns(&previous)[0];
    assert_eq!(turn.message.id, "m1");
    assert_eq!(turn.message.status, MessageStatus::Incomplete);
    assert_eq!(turn.message.content.text(), "Once upon");
}

/// Events addressed to a background conversation land in its cached
/// context and do not touch the active one
#[tokio::test]
async fn test_events_route_to_their_conversation() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;
    let first = s.handle.create_conversation(None).await.unwrap();
    let second = s.handle.create_conversation(None).await.unwrap();
    assert_ne!(first.id, second.id);

    let id = first.id.as_str();
    s.push(&[
        frames::in_conversation(&frames::message_start("bg1", "ai"), id),
        frames::in_conversation(&frames::message_delta("bg1", "background work"), id),
    ])
    .await;
    wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::ConversationUpdated { conversation_id } if conversation_id == &first.id)
    })
    .await;

    let active = s.snapshot().await;
    assert_eq!(active.conversation.id, second.id);
    assert!(active.turns.is_empty());
    assert_eq!(active.state, SessionState::IDLE);

    s.handle.switch_conversation(first.id.clone()).await.unwrap();
    let background = s
        .snapshot_when(|snap| !snap.turns.is_empty())
        .await;
    assert_eq!(background.turns[0].message.content.text(), "background work");
}

/// Cancelling a progressive load keeps what arrived and can be resumed
#[tokio::test]
async fn test_cancel_progressive_history_load() {
    let pages = vec![
        vec![WireMessage::new(Role::User, "p0").with_id("a")],
        vec![WireMessage::new(Role::User, "p1").with_id("b")],
        vec![WireMessage::new(Role::User, "p2").with_id("c")],
    ];
    let api = FakeConversationApi::new().with_history("big", pages);
    api.hold_pages_from(1);
    let mut s = mock_session(api);
    s.connect().await;

    s.handle
        .switch_conversation(ConversationId::from("big"))
        .await
        .unwrap();
    s.snapshot_when(|snap| snap.turns.len() == 1).await;

    s.handle.cancel_progressive_load();
    s.api.release_pages();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let partial = s.snapshot().await;
    assert_eq!(partial.turns.len(), 1);
    assert!(!partial.history_complete);

    // Leaving and coming back picks the load up at the saved cursor.
    s.handle.create_conversation(None).await.unwrap();
    s.handle
        .switch_conversation(ConversationId::from("big"))
        .await
        .unwrap();
    let full = s.snapshot_when(|snap| snap.history_complete).await;
    let ids: Vec<_> = full.turns.iter().map(|t| t.message.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(s
        .api
        .fetches()
        .iter()
        .any(|(id, cursor)| id.as_str() == "big" && cursor.as_deref() == Some("1")));
}

/// Deleting the active conversation evicts it and clears the pointer
#[tokio::test]
async fn test_delete_active_conversation() {
    let mut s = mock_session(FakeConversationApi::new());
    s.connect().await;
    let conversation = s.handle.create_conversation(None).await.unwrap();

    s.handle
        .delete_conversation(conversation.id.clone())
        .await
        .unwrap();
    let deleted = wait_for(&mut s.events, |e| {
        matches!(e, SessionEvent::ConversationDeleted(_))
    })
    .await;
    assert_eq!(deleted, SessionEvent::ConversationDeleted(conversation.id.clone()));
    assert!(s.handle.snapshot().await.unwrap().is_none());
    assert_eq!(s.api.deleted(), vec![conversation.id]);
}
