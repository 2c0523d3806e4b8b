use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{
    ActionRequest, ContentBlock, ConversationId, FileArtifact, MessageContent, ReviewConfig, Role,
    TodoItem,
};

/// Server-to-client conversation event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Transport handshake acknowledged
    Connected(ConnectedEvent),

    /// A message began streaming
    MessageStart(MessageStartEvent),

    /// Text appended to a streaming message
    MessageDelta(MessageDeltaEvent),

    /// Streaming message finalized
    MessageEnd(MessageEndEvent),

    /// Tool invocation started
    ToolCallStart(ToolCallStartEvent),

    /// Streamed tool-call argument text
    ToolCallArgsDelta(ToolCallArgsDeltaEvent),

    /// Tool invocation finished
    ToolCallResult(ToolCallResultEvent),

    /// Delegation to a sub-agent started
    SubagentStart(SubagentStartEvent),

    /// Sub-agent progress
    SubagentUpdate(SubagentUpdateEvent),

    /// Sub-agent finished
    SubagentEnd(SubagentEndEvent),

    /// Todo list replaced
    TodoUpdate(TodoUpdateEvent),

    /// File artifact written
    FileUpdate(FileUpdateEvent),

    /// Turn suspended pending a human decision
    Interrupt(InterruptEvent),

    /// Authoritative state snapshot
    StateUpdate(StateUpdateEvent),

    /// Server-side failure
    Error(ErrorEvent),

    /// Turn completed
    Done,
}

impl ServerEvent {
    /// Every `type` discriminator the decoder understands.
    pub const KNOWN_TYPES: [&'static str; 16] = [
        "connected",
        "message_start",
        "message_delta",
        "message_end",
        "tool_call_start",
        "tool_call_args_delta",
        "tool_call_result",
        "subagent_start",
        "subagent_update",
        "subagent_end",
        "todo_update",
        "file_update",
        "interrupt",
        "state_update",
        "error",
        "done",
    ];

    pub fn event_type_name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::MessageStart(_) => "message_start",
            ServerEvent::MessageDelta(_) => "message_delta",
            ServerEvent::MessageEnd(_) => "message_end",
            ServerEvent::ToolCallStart(_) => "tool_call_start",
            ServerEvent::ToolCallArgsDelta(_) => "tool_call_args_delta",
            ServerEvent::ToolCallResult(_) => "tool_call_result",
            ServerEvent::SubagentStart(_) => "subagent_start",
            ServerEvent::SubagentUpdate(_) => "subagent_update",
            ServerEvent::SubagentEnd(_) => "subagent_end",
            ServerEvent::TodoUpdate(_) => "todo_update",
            ServerEvent::FileUpdate(_) => "file_update",
            ServerEvent::Interrupt(_) => "interrupt",
            ServerEvent::StateUpdate(_) => "state_update",
            ServerEvent::Error(_) => "error",
            ServerEvent::Done => "done",
        }
    }
}

/// Decoded frame: the event plus its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event: ServerEvent,
    /// Target conversation; `None` means the active one.
    pub conversation_id: Option<ConversationId>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            conversation_id: None,
            timestamp: None,
        }
    }

    pub fn for_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    /// Encode as a wire frame (`{type, data, conversationId?, timestamp?}`).
    pub fn to_frame(&self) -> String {
        let mut frame = match serde_json::to_value(&self.event) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(id) = &self.conversation_id {
            frame.insert("conversationId".into(), Value::String(id.to_string()));
        }
        if let Some(ts) = &self.timestamp {
            frame.insert("timestamp".into(), Value::String(ts.to_rfc3339()));
        }
        Value::Object(frame).to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStartEvent {
    pub message_id: String,
    #[serde(default = "default_stream_role")]
    pub role: Role,
}

fn default_stream_role() -> Role {
    Role::Assistant
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeltaEvent {
    pub message_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEndEvent {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStartEvent {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Owning assistant message, when the server names it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallArgsDeltaEvent {
    pub tool_call_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResultEvent {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentStartEvent {
    pub sub_agent_id: String,
    pub sub_agent_name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentUpdateEvent {
    pub sub_agent_id: String,
    #[serde(default)]
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentEndEvent {
    pub sub_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoUpdateEvent {
    pub todos: Vec<TodoItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUpdateEvent {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl FileUpdateEvent {
    pub fn into_artifact(self) -> FileArtifact {
        FileArtifact {
            path: self.path,
            content: self.content,
            language: self.language,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEvent {
    pub interrupt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub action_requests: Vec<ActionRequest>,
    #[serde(default)]
    pub review_configs: Vec<ReviewConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<WireMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileArtifact>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Server marks the error as unrecoverable for this session.
    #[serde(default)]
    pub fatal: bool,
}

impl ErrorEvent {
    const AUTH_CODES: [&'static str; 4] = ["unauthorized", "forbidden", "auth_failed", "401"];

    /// Auth rejections and explicitly fatal errors end the session.
    pub fn is_unrecoverable(&self) -> bool {
        self.fatal
            || self
                .code
                .as_deref()
                .is_some_and(|code| Self::AUTH_CODES.contains(&code.to_ascii_lowercase().as_str()))
    }
}

// ============================================================================
// Message shapes carried by state snapshots and history pages
// ============================================================================

/// A message as the backend stores it. Tool calls may be encoded three ways;
/// `correlation::extract` resolves them once at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "type")]
    pub role: Role,
    #[serde(default, deserialize_with = "MessageContent::null_as_empty")]
    pub content: MessageContent,
    #[serde(
        default,
        rename = "toolCalls",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(
        default,
        rename = "tool_calls",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_tool_calls: Option<Vec<WireToolCall>>,
    #[serde(
        default,
        alias = "toolCallId",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl WireMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            legacy_tool_calls: None,
            tool_call_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_blocks(mut self, blocks: Vec<ContentBlock>) -> Self {
        self.content = MessageContent::Blocks(blocks);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "arguments",
        alias = "input",
        skip_serializing_if = "Option::is_none"
    )]
    pub args: Option<Value>,
    /// OpenAI-style `{name, arguments}` where `arguments` is a JSON string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<WireFunction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}
