//! Conversation data model shared by the correlation engine, the session
//! controller and hosts rendering snapshots.

pub mod artifacts;
pub mod conversation;
pub mod interrupt;
pub mod message;

pub use artifacts::{FileArtifact, TodoItem, TodoStatus};
pub use conversation::{Conversation, ConversationId, ConversationStatus};
pub use interrupt::{
    ActionRequest, Decision, DecisionKind, DecisionScope, InterruptRequest, ResumeRequest,
    ReviewConfig,
};
pub use message::{
    ContentBlock, Message, MessageContent, MessageStatus, Role, SubAgentInvocation, ToolCall,
    ToolCallStatus, Turn,
};
