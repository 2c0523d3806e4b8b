use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Author of a message. The wire also uses LangGraph-style `human`/`ai`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "human")]
    User,
    #[serde(alias = "ai")]
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Message body: either plain text or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Deserialize helper treating `null` as empty content.
    pub fn null_as_empty<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Self>::deserialize(deserializer)?.unwrap_or_default())
    }

    /// Visible text, with text blocks joined by newlines.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Append streamed text. Block content grows its trailing text block.
    pub fn push_str(&mut self, delta: &str) {
        match self {
            MessageContent::Text(text) => text.push_str(delta),
            MessageContent::Blocks(blocks) => match blocks.last_mut() {
                Some(ContentBlock::Text { text }) => text.push_str(delta),
                _ => blocks.push(ContentBlock::Text {
                    text: delta.to_string(),
                }),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

/// Lifecycle of a message inside the correlation map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Rendered locally before the server acknowledged it.
    Optimistic,
    /// Content is still accumulating deltas.
    Streaming,
    /// Streaming stopped early (transport lost or user stop); content frozen.
    Incomplete,
    /// Immutable.
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Interrupted,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Error)
    }

    /// Transitions are monotonic: nothing leaves `Completed`/`Error`.
    pub fn can_transition_to(&self, next: ToolCallStatus) -> bool {
        use ToolCallStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Interrupted | Completed | Error)
                | (Running, Interrupted | Completed | Error)
                | (Interrupted, Running | Completed | Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Running => "running",
            ToolCallStatus::Interrupted => "interrupted",
            ToolCallStatus::Completed => "completed",
            ToolCallStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: ToolCallStatus,
    /// Raw streamed argument text, kept until it parses.
    #[serde(skip)]
    args_buffer: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
        status: ToolCallStatus,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            result: None,
            error: None,
            status,
            args_buffer: String::new(),
        }
    }

    /// Move to `next` if the state machine allows it. Returns whether it did.
    pub fn transition(&mut self, next: ToolCallStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            if self.status != next {
                tracing::debug!(
                    tool_call_id = %self.id,
                    from = self.status.as_str(),
                    to = next.as_str(),
                    "Ignoring illegal tool call transition"
                );
            }
            false
        }
    }

    pub fn complete(&mut self, result: Option<String>) -> bool {
        if !self.transition(ToolCallStatus::Completed) {
            return false;
        }
        self.result = result;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, result: Option<String>) -> bool {
        if !self.transition(ToolCallStatus::Error) {
            return false;
        }
        self.error = Some(error.into());
        self.result = result;
        true
    }

    /// Accumulate streamed argument JSON; `args` follows the buffer whenever
    /// it parses.
    pub fn push_args_delta(&mut self, delta: &str) {
        self.args_buffer.push_str(delta);
        if let Ok(parsed) = serde_json::from_str::<Value>(&self.args_buffer) {
            self.args = parsed;
        }
    }

    /// Append streamed output (sub-agent progress).
    pub fn push_result_delta(&mut self, delta: &str) {
        self.result.get_or_insert_with(String::new).push_str(delta);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default, deserialize_with = "MessageContent::null_as_empty")]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: MessageContent) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: Map::new(),
            status: MessageStatus::Final,
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self.status,
            MessageStatus::Streaming | MessageStatus::Optimistic
        )
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|call| call.id == id)
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        self.tool_calls.iter_mut().find(|call| call.id == id)
    }
}

/// A tool call that delegates work to a named sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: ToolCallStatus,
}

impl SubAgentInvocation {
    pub const DEFAULT_AGENT: &'static str = "general-purpose";

    pub fn from_tool_call(call: &ToolCall) -> Self {
        let name = ["subagent_type", "subagent", "name"]
            .iter()
            .find_map(|key| call.args.get(key).and_then(Value::as_str))
            .unwrap_or(Self::DEFAULT_AGENT)
            .to_string();
        let input = ["description", "prompt", "input"]
            .iter()
            .find_map(|key| call.args.get(key).cloned())
            .unwrap_or_else(|| call.args.clone());

        Self {
            id: call.id.clone(),
            name,
            input,
            output: call.result.clone(),
            error: call.error.clone(),
            status: call.status,
        }
    }
}

/// Display unit produced by the correlation engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub message: Message,
    pub tool_calls: Vec<ToolCall>,
    pub sub_agents: Vec<SubAgentInvocation>,
    pub show_avatar: bool,
}
