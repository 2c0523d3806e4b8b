//! Session wiring over the mock transport.

use std::sync::Arc;
use std::time::Duration;

use chat_stream::client::StaticTokenProvider;
use chat_stream::config::Config;
use chat_stream::session::{
    ConversationSnapshot, SessionController, SessionEvent, SessionHandle, SessionState,
};
use chat_stream::transport::{MockConfig, MockRemote, MockTransport};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::FakeConversationApi;

pub struct TestSession {
    pub handle: SessionHandle,
    pub remote: MockRemote,
    pub api: Arc<FakeConversationApi>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

impl TestSession {
    /// Connect and wait for the handshake to be acknowledged.
    pub async fn connect(&mut self) {
        self.handle.connect().await.expect("connect");
        wait_for(&mut self.events, |e| {
            matches!(e, SessionEvent::StateChanged(s) if s.is_connected())
        })
        .await;
    }

    pub async fn push(&self, frames: &[String]) {
        for frame in frames {
            assert!(self.remote.push_frame(frame.clone()).await, "not connected");
        }
    }

    pub async fn state(&self) -> SessionState {
        self.handle.state().await.expect("state")
    }

    pub async fn snapshot(&self) -> ConversationSnapshot {
        self.handle
            .snapshot()
            .await
            .expect("snapshot")
            .expect("active conversation")
    }

    /// Poll the active snapshot until `predicate` holds.
    pub async fn snapshot_when(
        &self,
        predicate: impl Fn(&ConversationSnapshot) -> bool,
    ) -> ConversationSnapshot {
        let poll = async {
            loop {
                if let Ok(Some(snapshot)) = self.handle.snapshot().await {
                    if predicate(&snapshot) {
                        return snapshot;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), poll)
            .await
            .expect("timed out waiting for snapshot")
    }
}

/// Config with fast reconnects for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.reconnect.initial_delay_ms = 10;
    config.reconnect.max_delay_ms = 50;
    config.connection.stop_timeout_ms = 50;
    config.connection.action_timeout_ms = 500;
    config
}

pub fn mock_session(api: FakeConversationApi) -> TestSession {
    mock_session_with(api, MockConfig::default().acknowledge_on_connect(), test_config())
}

pub fn mock_session_with(
    api: FakeConversationApi,
    transport: MockConfig,
    config: Config,
) -> TestSession {
    let transport = MockTransport::new(transport);
    let remote = transport.remote();
    let api = Arc::new(api);
    let controller = SessionController::new(
        Box::new(transport),
        api.clone(),
        Arc::new(StaticTokenProvider::new("test-token")),
        config,
    );
    let events = controller.subscribe();
    let (handle, task) = SessionHandle::spawn(controller);
    TestSession {
        handle,
        remote,
        api,
        events,
        task,
    }
}

/// Wait (bounded) for the first event matching `predicate`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("session closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("timed out waiting for session event")
}
