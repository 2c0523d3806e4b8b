use crate::client::ApiError;
use crate::correlation::CorrelationMiss;
use crate::model::DecisionKind;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Failure classes the host reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection dropped; retried with backoff
    TransportLost,
    /// Malformed or unknown frame; skipped
    Protocol,
    /// Tool result without a matching call; discarded
    CorrelationMiss,
    /// Explicit server error; turn aborted
    Server,
    /// Optimistic message never confirmed; rolled back
    OptimisticMismatch,
    /// Operation not valid in the current state
    Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Correlation(#[from] CorrelationMiss),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// No auth token yet
    #[error("Session not ready: no auth token")]
    NotReady,

    #[error("Not connected")]
    NotConnected,

    #[error("A message is already awaiting confirmation")]
    SendInFlight,

    #[error("Conversation is waiting on an interrupt decision")]
    InterruptPending,

    #[error("No active interrupt")]
    NoActiveInterrupt,

    #[error("Interrupt {interrupt_id} already has a resume in flight")]
    ResumeAlreadyPending { interrupt_id: String },

    #[error("Decision {} is not allowed for {action}", .kind.as_str())]
    DecisionNotAllowed { action: String, kind: DecisionKind },

    #[error("Expected {expected} decisions, got {actual}")]
    DecisionCountMismatch { expected: usize, actual: usize },

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Server error: {message}")]
    Server {
        message: String,
        code: Option<String>,
    },

    #[error("Message {message_id} was not confirmed: {reason}")]
    OptimisticMismatch { message_id: String, reason: String },

    /// Reconnect attempts used up
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Controller task is gone
    #[error("Session closed")]
    Closed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport(TransportError::Unauthorized) => ErrorKind::Server,
            SessionError::Transport(_) | SessionError::ReconnectExhausted { .. } => {
                ErrorKind::TransportLost
            }
            SessionError::Protocol(_) => ErrorKind::Protocol,
            SessionError::Correlation(_) => ErrorKind::CorrelationMiss,
            SessionError::Server { .. } | SessionError::Api(_) => ErrorKind::Server,
            SessionError::OptimisticMismatch { .. } => ErrorKind::OptimisticMismatch,
            SessionError::NotReady
            | SessionError::NotConnected
            | SessionError::SendInFlight
            | SessionError::InterruptPending
            | SessionError::NoActiveInterrupt
            | SessionError::ResumeAlreadyPending { .. }
            | SessionError::DecisionNotAllowed { .. }
            | SessionError::DecisionCountMismatch { .. }
            | SessionError::NoActiveConversation
            | SessionError::Closed => ErrorKind::Usage,
        }
    }

    /// Only server errors and exhausted reconnects are shown as failures;
    /// everything else heals itself or is a caller mistake.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SessionError::Server { .. }
                | SessionError::Api(_)
                | SessionError::ReconnectExhausted { .. }
                | SessionError::Transport(TransportError::Unauthorized)
        )
    }
}
