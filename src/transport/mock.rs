//! In-memory transport for deterministic tests.
//!
//! The controller owns the [`MockTransport`]; the test keeps a
//! [`MockRemote`] to play the server side: push frames, drop the
//! connection, and inspect the actions the client sent.
//!
//! # Example
//! ```no_run
//! use chat_stream::transport::{MockConfig, MockTransport};
//!
//! # async fn demo() {
//! let transport = MockTransport::new(MockConfig::default().acknowledge_on_connect());
//! let remote = transport.remote();
//! // hand `transport` to a SessionController, then:
//! remote.push_frame(r#"{"type":"done"}"#).await;
//! assert!(remote.sent_actions().is_empty());
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportMode, TransportSignal};
use crate::protocol::{ClientAction, EventEnvelope};

#[derive(Clone, Debug, Default)]
pub struct MockConfig {
    /// Frames delivered right after `Opened` on every connect
    pub frames_on_connect: Vec<String>,
    /// Reported transport mode
    pub mode: TransportMode,
    /// Never complete `send` (an unresponsive server)
    pub hang_on_send: bool,
}

impl MockConfig {
    /// Send a `connected` acknowledgement after each connect.
    pub fn acknowledge_on_connect(mut self) -> Self {
        self.frames_on_connect
            .push(r#"{"type":"connected","data":{}}"#.to_string());
        self
    }

    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames_on_connect.extend(frames);
        self
    }

    pub fn hanging_sends(mut self) -> Self {
        self.hang_on_send = true;
        self
    }

    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Recorded connect attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockConnect {
    pub endpoint: String,
    pub token: String,
}

#[derive(Default)]
struct MockShared {
    signals: Mutex<Option<mpsc::Sender<TransportSignal>>>,
    actions: Mutex<Vec<ClientAction>>,
    connects: Mutex<Vec<MockConnect>>,
    connect_failures: Mutex<VecDeque<TransportError>>,
    send_failures: Mutex<VecDeque<TransportError>>,
    closes: Mutex<usize>,
    hang_on_send: AtomicBool,
}

pub struct MockTransport {
    config: MockConfig,
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        let shared = MockShared {
            hang_on_send: AtomicBool::new(config.hang_on_send),
            ..MockShared::default()
        };
        Self {
            config,
            shared: Arc::new(shared),
        }
    }

    /// Server-side handle. Cloneable; outlives reconnects.
    pub fn remote(&self) -> MockRemote {
        MockRemote {
            shared: self.shared.clone(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn mode(&self) -> TransportMode {
        self.config.mode
    }

    async fn connect(
        &mut self,
        endpoint: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<TransportSignal>, TransportError> {
        self.shared.connects.lock().push(MockConnect {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        });
        if let Some(err) = self.shared.connect_failures.lock().pop_front() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(256);
        let _ = tx.send(TransportSignal::Opened).await;
        for frame in &self.config.frames_on_connect {
            let _ = tx.send(TransportSignal::Frame(frame.clone())).await;
        }
        *self.shared.signals.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, action: &ClientAction) -> Result<(), TransportError> {
        if self.shared.signals.lock().is_none() {
            return Err(TransportError::Closed);
        }
        if let Some(err) = self.shared.send_failures.lock().pop_front() {
            return Err(err);
        }
        self.shared.actions.lock().push(action.clone());
        if self.shared.hang_on_send.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        *self.shared.closes.lock() += 1;
        self.shared.signals.lock().take();
    }

    fn is_connected(&self) -> bool {
        self.shared.signals.lock().is_some()
    }
}

#[derive(Clone)]
pub struct MockRemote {
    shared: Arc<MockShared>,
}

impl MockRemote {
    fn sender(&self) -> Option<mpsc::Sender<TransportSignal>> {
        self.shared.signals.lock().clone()
    }

    /// Deliver a raw frame. Returns false when nothing is connected.
    pub async fn push_frame(&self, frame: impl Into<String>) -> bool {
        match self.sender() {
            Some(tx) => tx.send(TransportSignal::Frame(frame.into())).await.is_ok(),
            None => false,
        }
    }

    pub async fn push_event(&self, envelope: &EventEnvelope) -> bool {
        self.push_frame(envelope.to_frame()).await
    }

    /// Simulate an unexpected disconnect.
    pub async fn drop_connection(&self, reason: &str) {
        let sender = self.shared.signals.lock().take();
        if let Some(tx) = sender {
            let _ = tx
                .send(TransportSignal::Lost {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    pub fn fail_next_connect(&self, err: TransportError) {
        self.shared.connect_failures.lock().push_back(err);
    }

    /// Make later sends hang (or stop hanging).
    pub fn set_hanging_sends(&self, hang: bool) {
        self.shared.hang_on_send.store(hang, Ordering::SeqCst);
    }

    pub fn fail_next_send(&self, err: TransportError) {
        self.shared.send_failures.lock().push_back(err);
    }

    pub fn sent_actions(&self) -> Vec<ClientAction> {
        self.shared.actions.lock().clone()
    }

    pub fn clear_actions(&self) {
        self.shared.actions.lock().clear();
    }

    pub fn connects(&self) -> Vec<MockConnect> {
        self.shared.connects.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        *self.shared.closes.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.signals.lock().is_some()
    }
}
