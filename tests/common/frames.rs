//! Builders for raw server frames, as they appear on the wire.

use serde_json::{json, Value};

pub fn frame(event_type: &str, data: Value) -> String {
    json!({ "type": event_type, "data": data }).to_string()
}

/// Same frame, addressed to a specific conversation.
pub fn in_conversation(frame: &str, conversation_id: &str) -> String {
    let mut value: Value = serde_json::from_str(frame).expect("frame is JSON");
    value["conversationId"] = json!(conversation_id);
    value.to_string()
}

pub fn connected() -> String {
    frame("connected", json!({}))
}

pub fn message_start(message_id: &str, role: &str) -> String {
    frame("message_start", json!({ "messageId": message_id, "role": role }))
}

pub fn message_delta(message_id: &str, delta: &str) -> String {
    frame("message_delta", json!({ "messageId": message_id, "delta": delta }))
}

pub fn message_end(message_id: &str) -> String {
    frame("message_end", json!({ "messageId": message_id }))
}

pub fn tool_call_start(tool_call_id: &str, tool_name: &str) -> String {
    frame(
        "tool_call_start",
        json!({ "toolCallId": tool_call_id, "toolName": tool_name }),
    )
}

pub fn tool_call_result(tool_call_id: &str, result: &str) -> String {
    frame(
        "tool_call_result",
        json!({ "toolCallId": tool_call_id, "result": result }),
    )
}

pub fn interrupt(interrupt_id: &str, actions: &[&str]) -> String {
    let requests: Vec<Value> = actions
        .iter()
        .map(|name| json!({ "name": name, "args": {} }))
        .collect();
    frame(
        "interrupt",
        json!({
            "interruptId": interrupt_id,
            "reason": "approval required",
            "actionRequests": requests,
        }),
    )
}

pub fn error(message: &str, code: Option<&str>) -> String {
    match code {
        Some(code) => frame("error", json!({ "message": message, "code": code })),
        None => frame("error", json!({ "message": message })),
    }
}

pub fn done() -> String {
    json!({ "type": "done" }).to_string()
}
