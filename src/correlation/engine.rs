use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::correlation::extract::{
    content_result_text, extract_tool_calls, result_text, ExtractedToolCall, ToolCallSource,
};
use crate::model::{
    Message, MessageContent, MessageStatus, Role, SubAgentInvocation, ToolCall, ToolCallStatus,
    Turn,
};
use crate::protocol::{
    MessageDeltaEvent, MessageEndEvent, MessageStartEvent, SubagentEndEvent, SubagentStartEvent,
    SubagentUpdateEvent, ToolCallArgsDeltaEvent, ToolCallResultEvent, ToolCallStartEvent,
    WireMessage,
};

/// Tool name the backend uses for delegating to a sub-agent.
pub const DEFAULT_DELEGATION_TOOL: &str = "task";

/// A tool result that matched no open tool call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No open tool call matches result for {tool_call_id}")]
pub struct CorrelationMiss {
    pub tool_call_id: String,
}

/// Folds the event/message sequence of one conversation into ordered,
/// display-ready turns.
///
/// Messages live in insertion order with an id index beside them. Tool
/// results are correlated by scanning every message, not only the latest,
/// because reconnects can deliver results late.
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    delegation_tools: Vec<String>,
    anonymous_ids: u64,
    misses: u64,
    /// Messages frozen by a user stop; late deltas for them are dropped
    stopped: HashSet<String>,
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::with_delegation_tools(vec![DEFAULT_DELEGATION_TOOL.to_string()])
    }

    pub fn with_delegation_tools(delegation_tools: Vec<String>) -> Self {
        Self {
            messages: Vec::new(),
            index: HashMap::new(),
            delegation_tools,
            anonymous_ids: 0,
            misses: 0,
            stopped: HashSet::new(),
        }
    }

    pub fn is_delegation(&self, tool_name: &str) -> bool {
        self.delegation_tools.iter().any(|t| t == tool_name)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of tool results dropped for lack of a matching call.
    pub fn correlation_misses(&self) -> u64 {
        self.misses
    }

    pub fn find_tool_call(&self, tool_call_id: &str) -> Option<&ToolCall> {
        self.messages
            .iter()
            .find_map(|m| m.tool_call(tool_call_id))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.stopped.clear();
    }

    // ------------------------------------------------------------------
    // Stored messages (history pages, state snapshots)
    // ------------------------------------------------------------------

    /// Ingest a stored message. `tool` messages resolve their call and are
    /// not kept as turns.
    pub fn ingest(
        &mut self,
        wire: WireMessage,
        interrupt_active: bool,
    ) -> Result<(), CorrelationMiss> {
        self.ingest_at(wire, interrupt_active, None).map(|_| ())
    }

    /// Splice a page of stored history in front of anything that arrived
    /// live. `at` is the number of history messages already placed.
    /// Returns how many new messages were inserted.
    pub fn ingest_history(
        &mut self,
        page: Vec<WireMessage>,
        at: usize,
        interrupt_active: bool,
    ) -> (usize, Vec<CorrelationMiss>) {
        let mut inserted = 0;
        let mut misses = Vec::new();
        for wire in page {
            let position = (at + inserted).min(self.messages.len());
            match self.ingest_at(wire, interrupt_active, Some(position)) {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(miss) => misses.push(miss),
            }
        }
        (inserted, misses)
    }

    fn ingest_at(
        &mut self,
        wire: WireMessage,
        interrupt_active: bool,
        position: Option<usize>,
    ) -> Result<bool, CorrelationMiss> {
        if wire.role == Role::Tool {
            let Some(tool_call_id) = wire.tool_call_id.clone() else {
                tracing::warn!(
                    message_id = ?wire.id,
                    "Dropping tool message without tool_call_id"
                );
                return Ok(false);
            };
            let text = content_result_text(&wire.content);
            return self
                .resolve_tool_call(&tool_call_id, Some(text), None)
                .map(|_| false);
        }

        let extracted = extract_tool_calls(&wire);
        let id = match wire.id.clone() {
            Some(id) if !id.is_empty() => id,
            _ => self.next_anonymous_id(),
        };
        let initial = initial_status(interrupt_active);

        if let Some(&i) = self.index.get(&id) {
            let existing = &mut self.messages[i];
            // A live stream owns the content until it ends.
            if existing.status != MessageStatus::Streaming {
                existing.content = wire.content;
                existing.metadata = wire.metadata;
                existing.status = MessageStatus::Final;
            }
            merge_tool_calls(existing, extracted, initial);
            return Ok(false);
        }

        let mut message = Message::new(id, wire.role, wire.content);
        message.metadata = wire.metadata;
        merge_tool_calls(&mut message, extracted, initial);
        match position {
            Some(at) if at < self.messages.len() => {
                self.messages.insert(at, message);
                self.reindex();
            }
            _ => self.push(message),
        }
        Ok(true)
    }

    /// Replace everything with an authoritative snapshot. Calls that had
    /// already reached a terminal status keep it, so a snapshot lagging
    /// behind streamed results never moves a call backwards.
    pub fn replace_all(
        &mut self,
        snapshot: Vec<WireMessage>,
        interrupt_active: bool,
    ) -> Vec<CorrelationMiss> {
        let settled: HashMap<String, ToolCall> = self
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| c.status.is_terminal())
            .map(|c| (c.id.clone(), c.clone()))
            .collect();

        self.clear();
        let mut misses = Vec::new();
        for wire in snapshot {
            if let Err(miss) = self.ingest(wire, interrupt_active) {
                misses.push(miss);
            }
        }

        for message in &mut self.messages {
            for call in &mut message.tool_calls {
                if call.status.is_terminal() {
                    continue;
                }
                if let Some(done) = settled.get(&call.id) {
                    *call = done.clone();
                }
            }
        }
        misses
    }

    // ------------------------------------------------------------------
    // Streaming events
    // ------------------------------------------------------------------

    pub fn message_start(&mut self, event: &MessageStartEvent) {
        if let Some(&i) = self.index.get(&event.message_id) {
            let existing = &mut self.messages[i];
            match existing.status {
                MessageStatus::Final => {
                    tracing::debug!(
                        message_id = %event.message_id,
                        "Ignoring message_start for finalized message"
                    );
                }
                MessageStatus::Incomplete if self.stopped.contains(&event.message_id) => {
                    tracing::debug!(
                        message_id = %event.message_id,
                        "Ignoring message_start for message stopped by the user"
                    );
                }
                MessageStatus::Streaming | MessageStatus::Incomplete => {
                    // Server is replaying the message from the start.
                    existing.content = MessageContent::default();
                    existing.status = MessageStatus::Streaming;
                }
                MessageStatus::Optimistic => {
                    existing.status = MessageStatus::Final;
                }
            }
            return;
        }

        let message = Message::new(
            event.message_id.clone(),
            event.role,
            MessageContent::default(),
        )
        .with_status(MessageStatus::Streaming);
        self.push(message);
    }

    pub fn message_delta(&mut self, event: &MessageDeltaEvent) {
        let Some(&i) = self.index.get(&event.message_id) else {
            tracing::debug!(
                message_id = %event.message_id,
                "Delta for unseen message; starting it implicitly"
            );
            let message = Message::new(
                event.message_id.clone(),
                Role::Assistant,
                MessageContent::Text(event.delta.clone()),
            )
            .with_status(MessageStatus::Streaming);
            self.push(message);
            return;
        };

        let message = &mut self.messages[i];
        match message.status {
            MessageStatus::Streaming => message.content.push_str(&event.delta),
            MessageStatus::Incomplete if self.stopped.contains(&event.message_id) => {
                tracing::debug!(
                    message_id = %event.message_id,
                    "Ignoring late delta for message stopped by the user"
                );
            }
            MessageStatus::Incomplete => {
                // Continuation after a reconnect picks up where it stopped.
                message.status = MessageStatus::Streaming;
                message.content.push_str(&event.delta);
            }
            MessageStatus::Final | MessageStatus::Optimistic => {
                tracing::debug!(
                    message_id = %event.message_id,
                    "Ignoring delta for immutable message"
                );
            }
        }
    }

    pub fn message_end(&mut self, event: &MessageEndEvent, interrupt_active: bool) {
        let initial = initial_status(interrupt_active);
        let i = match self.index.get(&event.message_id) {
            Some(&i) => i,
            None => {
                let Some(content) = event.content.clone() else {
                    tracing::debug!(
                        message_id = %event.message_id,
                        "message_end without start or content; nothing to show"
                    );
                    return;
                };
                self.push(Message::new(
                    event.message_id.clone(),
                    Role::Assistant,
                    content,
                ));
                self.messages.len() - 1
            }
        };

        let message = &mut self.messages[i];
        if let Some(content) = &event.content {
            message.content = content.clone();
        }
        message.status = MessageStatus::Final;
        let extracted = ToolCallSource::from_content(&message.content)
            .map(|source| source.extract())
            .unwrap_or_default();
        merge_tool_calls(message, extracted, initial);
    }

    pub fn tool_call_start(&mut self, event: &ToolCallStartEvent, interrupt_active: bool) {
        let args = event.args.clone();
        self.start_call(
            &event.tool_call_id,
            &event.tool_name,
            args,
            event.message_id.as_deref(),
            interrupt_active,
        );
    }

    pub fn tool_call_args_delta(
        &mut self,
        event: &ToolCallArgsDeltaEvent,
    ) -> Result<(), CorrelationMiss> {
        match self.open_call_mut(&event.tool_call_id) {
            Some(call) => {
                call.push_args_delta(&event.delta);
                Ok(())
            }
            None => Err(self.miss(&event.tool_call_id)),
        }
    }

    pub fn tool_call_result(&mut self, event: &ToolCallResultEvent) -> Result<(), CorrelationMiss> {
        let text = event.result.as_ref().map(result_text);
        self.resolve_tool_call(&event.tool_call_id, text, event.error.clone())
    }

    pub fn subagent_start(&mut self, event: &SubagentStartEvent, interrupt_active: bool) {
        let tool_name = self
            .delegation_tools
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_DELEGATION_TOOL.to_string());
        let args = json!({
            "subagent_type": event.sub_agent_name,
            "description": event.input,
        });
        self.start_call(
            &event.sub_agent_id,
            &tool_name,
            Some(args),
            None,
            interrupt_active,
        );
    }

    pub fn subagent_update(&mut self, event: &SubagentUpdateEvent) -> Result<(), CorrelationMiss> {
        match self.open_call_mut(&event.sub_agent_id) {
            Some(call) => {
                if call.status == ToolCallStatus::Pending {
                    call.transition(ToolCallStatus::Running);
                }
                call.push_result_delta(&event.delta);
                Ok(())
            }
            None => Err(self.miss(&event.sub_agent_id)),
        }
    }

    pub fn subagent_end(&mut self, event: &SubagentEndEvent) -> Result<(), CorrelationMiss> {
        let streamed = self
            .find_tool_call(&event.sub_agent_id)
            .and_then(|c| c.result.clone());
        let output = event.output.as_ref().map(result_text).or(streamed);
        self.resolve_tool_call(&event.sub_agent_id, output, event.error.clone())
    }

    // ------------------------------------------------------------------
    // Turn-level transitions
    // ------------------------------------------------------------------

    /// Flip open calls of the active turn (everything after the last user
    /// message) to `Interrupted`. Returns how many changed.
    pub fn mark_interrupted(&mut self) -> usize {
        let start = self.active_turn_start();
        let mut changed = 0;
        for message in &mut self.messages[start..] {
            for call in &mut message.tool_calls {
                if matches!(
                    call.status,
                    ToolCallStatus::Pending | ToolCallStatus::Running
                ) && call.transition(ToolCallStatus::Interrupted)
                {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Settle the active turn's interrupted calls as failed once the turn
    /// can no longer resume. Returns how many changed.
    pub fn fail_interrupted(&mut self, reason: &str) -> usize {
        let start = self.active_turn_start();
        let mut changed = 0;
        for message in &mut self.messages[start..] {
            for call in &mut message.tool_calls {
                if call.status == ToolCallStatus::Interrupted
                    && call.transition(ToolCallStatus::Error)
                {
                    call.error.get_or_insert_with(|| reason.to_string());
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Freeze streaming messages in place (stop or transport loss).
    pub fn freeze_streaming(&mut self) -> usize {
        let mut frozen = 0;
        for message in &mut self.messages {
            if message.status == MessageStatus::Streaming {
                message.status = MessageStatus::Incomplete;
                frozen += 1;
            }
        }
        frozen
    }

    /// User stop: freeze like a transport loss, but the frozen messages
    /// stay frozen until [`resume_stopped`](Self::resume_stopped).
    pub fn stop_streaming(&mut self) -> usize {
        let mut frozen = 0;
        for message in &mut self.messages {
            if message.status == MessageStatus::Streaming {
                message.status = MessageStatus::Incomplete;
                self.stopped.insert(message.id.clone());
                frozen += 1;
            }
        }
        frozen
    }

    /// The user asked the turn to continue; stopped messages may stream
    /// again.
    pub fn resume_stopped(&mut self) {
        self.stopped.clear();
    }

    /// Finalize whatever is still streaming at the end of a turn.
    pub fn finish_turn(&mut self) {
        for message in &mut self.messages {
            if message.status == MessageStatus::Streaming {
                message.status = MessageStatus::Final;
            }
        }
    }

    pub fn has_streaming(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.status == MessageStatus::Streaming)
    }

    // ------------------------------------------------------------------
    // Optimistic entries
    // ------------------------------------------------------------------

    pub fn push_optimistic(&mut self, id: &str, text: &str) {
        let message = Message::new(id, Role::User, MessageContent::Text(text.to_string()))
            .with_status(MessageStatus::Optimistic);
        self.push(message);
    }

    /// Confirm an optimistic entry, adopting the canonical id/content in the
    /// same list position. If the canonical message is already present the
    /// optimistic copy is dropped so the turn is never duplicated.
    pub fn confirm(
        &mut self,
        local_id: &str,
        canonical_id: Option<&str>,
        content: Option<MessageContent>,
    ) -> bool {
        let Some(&i) = self.index.get(local_id) else {
            return false;
        };

        let canonical_id = canonical_id.filter(|id| *id != local_id);
        if let Some(canonical) = canonical_id {
            if self.index.contains_key(canonical) {
                self.remove(local_id);
                return true;
            }
        }

        let message = &mut self.messages[i];
        if let Some(content) = content {
            message.content = content;
        }
        message.status = MessageStatus::Final;
        if let Some(canonical) = canonical_id {
            message.id = canonical.to_string();
            self.index.remove(local_id);
            self.index.insert(canonical.to_string(), i);
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let i = self.index.remove(id)?;
        let removed = self.messages.remove(i);
        self.reindex();
        Some(removed)
    }

    /// Ids of every server-known user message.
    pub fn user_message_ids(&self) -> HashSet<String> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User && m.status != MessageStatus::Optimistic)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Last server-known user message with exactly this text whose id is
    /// not in `known`.
    pub fn last_new_user_message_with_text(
        &self,
        text: &str,
        known: &HashSet<String>,
    ) -> Option<&Message> {
        self.messages.iter().rev().find(|m| {
            m.role == Role::User
                && m.status != MessageStatus::Optimistic
                && !known.contains(&m.id)
                && m.content.text() == text
        })
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Ordered display turns.
    pub fn turns(&self) -> Vec<Turn> {
        let mut turns: Vec<Turn> = Vec::with_capacity(self.messages.len());
        let mut previous_role: Option<Role> = None;

        for message in &self.messages {
            let (delegated, tools): (Vec<&ToolCall>, Vec<&ToolCall>) = message
                .tool_calls
                .iter()
                .partition(|call| self.is_delegation(&call.name));

            turns.push(Turn {
                message: message.clone(),
                tool_calls: tools.into_iter().cloned().collect(),
                sub_agents: delegated
                    .into_iter()
                    .map(SubAgentInvocation::from_tool_call)
                    .collect(),
                show_avatar: previous_role != Some(message.role),
            });
            previous_role = Some(message.role);
        }
        turns
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn push(&mut self, message: Message) {
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
    }

    fn reindex(&mut self) {
        self.index = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
    }

    fn next_anonymous_id(&mut self) -> String {
        loop {
            self.anonymous_ids += 1;
            let id = format!("anon-{}", self.anonymous_ids);
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    fn active_turn_start(&self) -> usize {
        self.messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    fn open_call_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolCall> {
        self.messages
            .iter_mut()
            .flat_map(|m| m.tool_calls.iter_mut())
            .find(|c| c.id == tool_call_id && !c.status.is_terminal())
    }

    fn miss(&mut self, tool_call_id: &str) -> CorrelationMiss {
        self.misses += 1;
        tracing::debug!(
            tool_call_id = %tool_call_id,
            "Discarding tool event with no open tool call"
        );
        CorrelationMiss {
            tool_call_id: tool_call_id.to_string(),
        }
    }

    fn resolve_tool_call(
        &mut self,
        tool_call_id: &str,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), CorrelationMiss> {
        let Some(call) = self.open_call_mut(tool_call_id) else {
            return Err(self.miss(tool_call_id));
        };
        match error {
            Some(error) => call.fail(error, result),
            None => call.complete(result),
        };
        Ok(())
    }

    fn start_call(
        &mut self,
        tool_call_id: &str,
        tool_name: &str,
        args: Option<Value>,
        owner: Option<&str>,
        interrupt_active: bool,
    ) {
        if let Some(existing) = self
            .messages
            .iter_mut()
            .flat_map(|m| m.tool_calls.iter_mut())
            .find(|c| c.id == tool_call_id)
        {
            if existing.status.is_terminal() {
                tracing::debug!(
                    tool_call_id = %tool_call_id,
                    "Ignoring start for settled tool call"
                );
                return;
            }
            if let Some(args) = args {
                existing.args = args;
            }
            if !interrupt_active {
                existing.transition(ToolCallStatus::Running);
            }
            return;
        }

        let status = if interrupt_active {
            ToolCallStatus::Interrupted
        } else {
            ToolCallStatus::Running
        };
        let call = ToolCall::new(
            tool_call_id,
            tool_name,
            args.unwrap_or_else(|| Value::Object(Default::default())),
            status,
        );

        let owner_index = self.owner_index(owner, tool_call_id);
        self.messages[owner_index].tool_calls.push(call);
    }

    /// Message that should own a newly started tool call: the named one,
    /// else the latest assistant message of the active turn, else a
    /// synthesized empty assistant message.
    fn owner_index(&mut self, owner: Option<&str>, tool_call_id: &str) -> usize {
        if let Some(&i) = owner.and_then(|id| self.index.get(id)) {
            return i;
        }
        let start = self.active_turn_start();
        if let Some(offset) = self.messages[start..]
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        {
            return start + offset;
        }

        let id = owner
            .map(str::to_string)
            .unwrap_or_else(|| format!("{tool_call_id}-owner"));
        self.push(Message::new(id, Role::Assistant, MessageContent::default()));
        self.messages.len() - 1
    }
}

fn initial_status(interrupt_active: bool) -> ToolCallStatus {
    if interrupt_active {
        ToolCallStatus::Interrupted
    } else {
        ToolCallStatus::Pending
    }
}

fn merge_tool_calls(message: &mut Message, extracted: Vec<ExtractedToolCall>, status: ToolCallStatus) {
    for call in extracted {
        match message.tool_call_mut(&call.id) {
            Some(existing) => {
                if existing.args.is_null()
                    || existing.args.as_object().is_some_and(|o| o.is_empty())
                {
                    existing.args = call.args;
                }
            }
            None => message
                .tool_calls
                .push(ToolCall::new(call.id, call.name, call.args, status)),
        }
    }
}
