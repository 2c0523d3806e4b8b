use serde::{Deserialize, Serialize};

use crate::model::{ConversationId, Decision};

/// Client-to-server intent. Every action names its conversation so the
/// unidirectional transport can correlate request calls without a session
/// handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    SendMessage {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        /// Client-generated id of the optimistic message.
        #[serde(rename = "messageId")]
        message_id: String,
        content: String,
    },
    ResumeInterrupt {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        #[serde(rename = "interruptId")]
        interrupt_id: String,
        /// One decision per action request, in request order.
        decisions: Vec<Decision>,
    },
    StopStream {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    ContinueStream {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    /// Point the live session at a conversation (switch or reconnect).
    Subscribe {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
}

impl ClientAction {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            ClientAction::SendMessage {
                conversation_id, ..
            }
            | ClientAction::ResumeInterrupt {
                conversation_id, ..
            }
            | ClientAction::StopStream { conversation_id }
            | ClientAction::ContinueStream { conversation_id }
            | ClientAction::Subscribe { conversation_id } => conversation_id,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            ClientAction::SendMessage { .. } => "send_message",
            ClientAction::ResumeInterrupt { .. } => "resume_interrupt",
            ClientAction::StopStream { .. } => "stop_stream",
            ClientAction::ContinueStream { .. } => "continue_stream",
            ClientAction::Subscribe { .. } => "subscribe",
        }
    }
}
