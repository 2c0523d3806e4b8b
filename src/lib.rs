pub mod client;
pub mod config;
pub mod correlation;
pub mod model;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod util;

pub use client::{AuthProvider, ConversationApi, EnvTokenProvider, HttpConversationApi};
pub use config::Config;
pub use correlation::CorrelationEngine;
pub use model::{Conversation, ConversationId, Decision, ResumeRequest, Turn};
pub use protocol::{ClientAction, EventDecoder, ServerEvent};
pub use session::{
    ConversationSnapshot, SessionController, SessionError, SessionEvent, SessionHandle,
    SessionState,
};
pub use transport::{Transport, TransportError, TransportMode};
