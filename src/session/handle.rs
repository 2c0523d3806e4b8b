//! Host-facing side of the session: a cloneable command sender and a
//! broadcast stream of typed notifications.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{Conversation, ConversationId, InterruptRequest, ResumeRequest};
use crate::session::context::ConversationSnapshot;
use crate::session::controller::SessionController;
use crate::session::error::{ErrorKind, SessionError};
use crate::session::state::SessionState;

/// Notifications for the host, replacing per-operation callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Something in this conversation's snapshot changed
    ConversationUpdated { conversation_id: ConversationId },
    InterruptRaised {
        conversation_id: ConversationId,
        request: InterruptRequest,
    },
    TurnCompleted { conversation_id: ConversationId },
    /// A failure the host should show: server errors, rejected credentials
    /// and connects that will not be retried
    ServerError {
        conversation_id: Option<ConversationId>,
        message: String,
        code: Option<String>,
        kind: ErrorKind,
    },
    /// Optimistic message rolled back
    SendFailed {
        conversation_id: ConversationId,
        text: String,
        reason: String,
        kind: ErrorKind,
    },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
    ConversationCreated(Conversation),
    ConversationDeleted(ConversationId),
    /// No auth token available yet
    NotReady,
}

/// Reply slot for one command.
pub type Responder<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests processed in order by [`SessionController::run`].
#[derive(Debug)]
pub enum SessionCommand {
    Connect(Responder<()>),
    Reconnect(Responder<()>),
    SendMessage {
        text: String,
        reply: Responder<String>,
    },
    ResumeInterrupt {
        request: ResumeRequest,
        reply: Responder<()>,
    },
    StopStream(Responder<()>),
    ContinueStream(Responder<()>),
    SwitchConversation {
        id: ConversationId,
        reply: Responder<()>,
    },
    CreateConversation {
        title: Option<String>,
        reply: Responder<Conversation>,
    },
    DeleteConversation {
        id: ConversationId,
        reply: Responder<()>,
    },
    State(oneshot::Sender<SessionState>),
    Snapshot(oneshot::Sender<Option<ConversationSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    history_cancel: Arc<Mutex<CancellationToken>>,
}

impl SessionHandle {
    /// Move the controller onto its own task and return a handle to it.
    pub fn spawn(controller: SessionController) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(controller.command_buffer());
        let handle = Self {
            commands,
            events: controller.event_sender(),
            history_cancel: controller.history_cancel(),
        };
        let task = tokio::spawn(controller.run(rx));
        (handle, task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Idempotent first connect.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Connect).await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Reconnect).await
    }

    /// Returns the client id of the optimistic message.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<String, SessionError> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendMessage { text, reply })
            .await
    }

    pub async fn resume_interrupt(&self, request: ResumeRequest) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ResumeInterrupt { request, reply })
            .await
    }

    /// Resolves once the session is idle locally; the server is told
    /// afterwards.
    pub async fn stop_stream(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::StopStream).await
    }

    pub async fn continue_stream(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::ContinueStream).await
    }

    pub async fn switch_conversation(&self, id: ConversationId) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SwitchConversation { id, reply })
            .await
    }

    pub async fn create_conversation(
        &self,
        title: Option<String>,
    ) -> Result<Conversation, SessionError> {
        self.request(|reply| SessionCommand::CreateConversation { title, reply })
            .await
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::DeleteConversation { id, reply })
            .await
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::State(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Snapshot of the active conversation.
    pub async fn snapshot(&self) -> Result<Option<ConversationSnapshot>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop paging in history. Safe at any time, including while the
    /// controller is busy with another command.
    pub fn cancel_progressive_load(&self) {
        self.history_cancel.lock().cancel();
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}
