use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::model::ConversationId;
use crate::protocol::error::ProtocolError;
use crate::protocol::events::*;

/// Turns raw transport frames into typed events.
///
/// Unknown event types are skipped so newer servers can add events without
/// breaking older clients. Malformed payloads are rejected before they reach
/// the correlation map.
#[derive(Debug, Default)]
pub struct EventDecoder {
    skipped_unknown: u64,
    dropped_malformed: u64,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame. `Ok(None)` means the event type is unknown and was
    /// skipped.
    pub fn decode(&mut self, raw: &str) -> Result<Option<EventEnvelope>, ProtocolError> {
        tracing::trace!("Raw frame: {}", raw);

        let value: Value = serde_json::from_str(raw).map_err(|e| self.malformed_json(e))?;
        let Value::Object(mut frame) = value else {
            self.dropped_malformed += 1;
            return Err(ProtocolError::MissingType);
        };
        let Some(event_type) = frame
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.dropped_malformed += 1;
            return Err(ProtocolError::MissingType);
        };
        let data = frame.remove("data").unwrap_or(Value::Null);

        self.finish(event_type, data, &frame)
    }

    /// Decode a named server-sent event. Frames whose data already carries a
    /// `type` are decoded as-is; otherwise the SSE event name is the type and
    /// the data is the payload.
    pub fn decode_named(
        &mut self,
        event_name: &str,
        data: &str,
    ) -> Result<Option<EventEnvelope>, ProtocolError> {
        let value: Value = serde_json::from_str(data).map_err(|e| self.malformed_json(e))?;
        let has_type = value.get("type").is_some_and(Value::is_string);
        if has_type || event_name.is_empty() || event_name == "message" {
            return self.decode(data);
        }
        self.finish(event_name.to_string(), value, &Map::new())
    }

    /// Decode, logging and discarding anything that fails.
    pub fn decode_lossy(&mut self, raw: &str) -> Option<EventEnvelope> {
        match self.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping frame: {e}. Frame: {raw}");
                None
            }
        }
    }

    pub fn skipped_unknown(&self) -> u64 {
        self.skipped_unknown
    }

    pub fn dropped_malformed(&self) -> u64 {
        self.dropped_malformed
    }

    fn finish(
        &mut self,
        event_type: String,
        data: Value,
        frame: &Map<String, Value>,
    ) -> Result<Option<EventEnvelope>, ProtocolError> {
        if !ServerEvent::KNOWN_TYPES.contains(&event_type.as_str()) {
            self.skipped_unknown += 1;
            tracing::debug!(event_type = %event_type, "Skipping unknown event type");
            return Ok(None);
        }

        let event = match parse_event(&event_type, data) {
            Ok(event) => event,
            Err(reason) => {
                self.dropped_malformed += 1;
                return Err(ProtocolError::Malformed { event_type, reason });
            }
        };

        let conversation_id = frame
            .get("conversationId")
            .or_else(|| frame.get("threadId"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ConversationId::from_string);
        let timestamp = frame.get("timestamp").and_then(parse_timestamp);

        Ok(Some(EventEnvelope {
            event,
            conversation_id,
            timestamp,
        }))
    }

    fn malformed_json(&mut self, err: serde_json::Error) -> ProtocolError {
        self.dropped_malformed += 1;
        ProtocolError::InvalidJson(err)
    }
}

fn parse_event(event_type: &str, data: Value) -> Result<ServerEvent, String> {
    let event = match event_type {
        "connected" => ServerEvent::Connected(payload(data)?),
        "message_start" => ServerEvent::MessageStart(payload(data)?),
        "message_delta" => ServerEvent::MessageDelta(payload(data)?),
        "message_end" => ServerEvent::MessageEnd(payload(data)?),
        "tool_call_start" => ServerEvent::ToolCallStart(payload(data)?),
        "tool_call_args_delta" => ServerEvent::ToolCallArgsDelta(payload(data)?),
        "tool_call_result" => ServerEvent::ToolCallResult(payload(data)?),
        "subagent_start" => ServerEvent::SubagentStart(payload(data)?),
        "subagent_update" => ServerEvent::SubagentUpdate(payload(data)?),
        "subagent_end" => ServerEvent::SubagentEnd(payload(data)?),
        "todo_update" => ServerEvent::TodoUpdate(payload(data)?),
        "file_update" => ServerEvent::FileUpdate(payload(data)?),
        "interrupt" => ServerEvent::Interrupt(payload(data)?),
        "state_update" => ServerEvent::StateUpdate(payload(data)?),
        "error" => ServerEvent::Error(payload(data)?),
        "done" => ServerEvent::Done,
        other => return Err(format!("unsupported event type {other}")),
    };
    validate_ids(&event)?;
    Ok(event)
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, String> {
    let data = match data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(data).map_err(|e| e.to_string())
}

/// Ids key the correlation map, so an empty one is as bad as a missing one.
fn validate_ids(event: &ServerEvent) -> Result<(), String> {
    let (field, id) = match event {
        ServerEvent::MessageStart(e) => ("messageId", e.message_id.as_str()),
        ServerEvent::MessageDelta(e) => ("messageId", e.message_id.as_str()),
        ServerEvent::MessageEnd(e) => ("messageId", e.message_id.as_str()),
        ServerEvent::ToolCallStart(e) => ("toolCallId", e.tool_call_id.as_str()),
        ServerEvent::ToolCallArgsDelta(e) => ("toolCallId", e.tool_call_id.as_str()),
        ServerEvent::ToolCallResult(e) => ("toolCallId", e.tool_call_id.as_str()),
        ServerEvent::SubagentStart(e) => ("subAgentId", e.sub_agent_id.as_str()),
        ServerEvent::SubagentUpdate(e) => ("subAgentId", e.sub_agent_id.as_str()),
        ServerEvent::SubagentEnd(e) => ("subAgentId", e.sub_agent_id.as_str()),
        ServerEvent::Interrupt(e) => ("interruptId", e.interrupt_id.as_str()),
        _ => return Ok(()),
    };
    if id.trim().is_empty() {
        return Err(format!("empty {field}"));
    }
    Ok(())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}
