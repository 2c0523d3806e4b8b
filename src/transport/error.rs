#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection dropped unexpectedly. The controller may reconnect.
    #[error("Transport lost: {0}")]
    Lost(String),

    /// Endpoint rejected the bearer token.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Failed to send {action}: {reason}")]
    Send { action: String, reason: String },

    /// Operation on a transport that is not connected.
    #[error("Transport is closed")]
    Closed,

    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Whether a reconnect attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Lost(_) | TransportError::Connect(_) | TransportError::Send { .. }
        )
    }
}
