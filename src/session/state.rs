use serde::Serialize;

/// Lifecycle of the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected(StreamPhase),
    Interrupted,
    /// Unrecoverable; only an explicit reconnect leaves it
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Idle,
    Streaming,
}

impl SessionState {
    pub const IDLE: SessionState = SessionState::Connected(StreamPhase::Idle);
    pub const STREAMING: SessionState = SessionState::Connected(StreamPhase::Streaming);

    /// A live connection exists (including while suspended on an interrupt).
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_) | SessionState::Interrupted)
    }

    pub fn is_streaming(&self) -> bool {
        *self == Self::STREAMING
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected(StreamPhase::Idle) => "idle",
            SessionState::Connected(StreamPhase::Streaming) => "streaming",
            SessionState::Interrupted => "interrupted",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
