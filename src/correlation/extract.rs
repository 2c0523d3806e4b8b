//! Tool-call extraction from the message shapes the backend has used over
//! time. Resolved once at ingestion; nothing downstream looks at the raw
//! shape again.

use serde_json::Value;

use crate::model::{ContentBlock, MessageContent};
use crate::protocol::{WireMessage, WireToolCall};

/// Normalized tool-call descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Where a message keeps its tool calls, in extraction priority order.
#[derive(Debug, Clone, Copy)]
pub enum ToolCallSource<'a> {
    /// Current `toolCalls` field
    Explicit(&'a [WireToolCall]),
    /// Legacy `tool_calls` array
    Legacy(&'a [WireToolCall]),
    /// `content` blocks of type `tool_use`
    ContentBlocks(&'a [ContentBlock]),
}

impl<'a> ToolCallSource<'a> {
    /// First non-empty shape wins.
    pub fn detect(message: &'a WireMessage) -> Option<Self> {
        if let Some(calls) = message.tool_calls.as_deref().filter(|c| !c.is_empty()) {
            return Some(ToolCallSource::Explicit(calls));
        }
        if let Some(calls) = message
            .legacy_tool_calls
            .as_deref()
            .filter(|c| !c.is_empty())
        {
            return Some(ToolCallSource::Legacy(calls));
        }
        Self::from_content(&message.content)
    }

    pub fn from_content(content: &'a MessageContent) -> Option<Self> {
        match content {
            MessageContent::Blocks(blocks)
                if blocks
                    .iter()
                    .any(|b| matches!(b, ContentBlock::ToolUse { .. })) =>
            {
                Some(ToolCallSource::ContentBlocks(blocks))
            }
            _ => None,
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            ToolCallSource::Explicit(_) => "toolCalls",
            ToolCallSource::Legacy(_) => "tool_calls",
            ToolCallSource::ContentBlocks(_) => "content.tool_use",
        }
    }

    pub fn extract(&self) -> Vec<ExtractedToolCall> {
        match self {
            ToolCallSource::Explicit(calls) | ToolCallSource::Legacy(calls) => {
                calls.iter().filter_map(normalize_wire_call).collect()
            }
            ToolCallSource::ContentBlocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } if !id.is_empty() => {
                        Some(ExtractedToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            args: input.clone(),
                        })
                    }
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Tool calls embedded in a message, whichever shape carries them.
pub fn extract_tool_calls(message: &WireMessage) -> Vec<ExtractedToolCall> {
    ToolCallSource::detect(message)
        .map(|source| source.extract())
        .unwrap_or_default()
}

fn normalize_wire_call(call: &WireToolCall) -> Option<ExtractedToolCall> {
    if call.id.is_empty() {
        tracing::warn!("Skipping tool call descriptor without id");
        return None;
    }
    let name = call
        .name
        .clone()
        .or_else(|| call.function.as_ref().map(|f| f.name.clone()))
        .unwrap_or_else(|| "tool".to_string());
    let args = match (&call.args, &call.function) {
        (Some(args), _) => args.clone(),
        (None, Some(function)) if !function.arguments.is_empty() => {
            serde_json::from_str(&function.arguments)
                .unwrap_or_else(|_| Value::String(function.arguments.clone()))
        }
        _ => Value::Object(Default::default()),
    };
    Some(ExtractedToolCall {
        id: call.id.clone(),
        name,
        args,
    })
}

/// Display text of a tool result payload.
pub fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|v| v.get("text").and_then(Value::as_str).map(String::from))
                .collect();
            if texts.is_empty() {
                value.to_string()
            } else {
                texts.join("\n")
            }
        }
        other => other.to_string(),
    }
}

/// Display text of a `tool` role message body.
pub fn content_result_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::ToolResult { content, .. } => Some(result_text(content)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
