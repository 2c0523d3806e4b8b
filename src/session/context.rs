//! Per-conversation state, cached for the lifetime of the session so
//! switching back and forth never loses or mixes anything.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::client::HistoryPage;
use crate::config::DisplaySettings;
use crate::correlation::{CorrelationEngine, CorrelationMiss};
use crate::model::{
    ActionRequest, Conversation, ConversationId, ConversationStatus, FileArtifact,
    InterruptRequest, Role, ToolCallStatus, TodoItem, Turn,
};
use crate::protocol::{ErrorEvent, InterruptEvent, ServerEvent};
use crate::session::error::SessionError;
use crate::session::interrupt::InterruptCoordinator;
use crate::session::optimistic::{OptimisticUpdateManager, PendingSend};
use crate::session::state::SessionState;

/// What applying one event means for the session as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEffect {
    /// Nothing beyond the context itself changed
    None,
    /// Transport handshake acknowledged
    Connected,
    /// Turn content arrived
    Activity,
    /// Tool event for a call that is not open; discarded
    Unmatched(CorrelationMiss),
    /// Turn suspended; `fresh` is false for a replay of the same interrupt
    Interrupted {
        request: InterruptRequest,
        fresh: bool,
    },
    /// Turn aborted by the server
    ServerError {
        error: ErrorEvent,
        rolled_back: Option<PendingSend>,
    },
    TurnCompleted,
}

fn activity(result: Result<(), CorrelationMiss>) -> ContextEffect {
    match result {
        Ok(()) => ContextEffect::Activity,
        Err(miss) => ContextEffect::Unmatched(miss),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HistoryProgress {
    /// History messages placed so far
    placed: usize,
    next_cursor: Option<String>,
    complete: bool,
    started: bool,
}

/// One conversation's messages, side-channel state, and interrupt.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub conversation: Conversation,
    engine: CorrelationEngine,
    optimistic: OptimisticUpdateManager,
    interrupt: InterruptCoordinator,
    todos: Vec<TodoItem>,
    files: BTreeMap<String, FileArtifact>,
    connection_state: SessionState,
    history: HistoryProgress,
    turn_in_flight: bool,
}

impl ConversationContext {
    pub fn new(conversation: Conversation, delegation_tools: Vec<String>) -> Self {
        Self {
            conversation,
            engine: CorrelationEngine::with_delegation_tools(delegation_tools),
            optimistic: OptimisticUpdateManager::new(),
            interrupt: InterruptCoordinator::new(),
            todos: Vec::new(),
            files: BTreeMap::new(),
            connection_state: SessionState::Disconnected,
            history: HistoryProgress::default(),
            turn_in_flight: false,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.conversation.id
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut CorrelationEngine {
        &mut self.engine
    }

    pub fn optimistic(&self) -> &OptimisticUpdateManager {
        &self.optimistic
    }

    pub fn interrupt(&self) -> &InterruptCoordinator {
        &self.interrupt
    }

    pub fn interrupt_mut(&mut self) -> &mut InterruptCoordinator {
        &mut self.interrupt
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn files(&self) -> impl Iterator<Item = &FileArtifact> {
        self.files.values()
    }

    pub fn connection_state(&self) -> SessionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: SessionState) {
        self.connection_state = state;
        let status = match state {
            SessionState::Interrupted => ConversationStatus::Interrupted,
            SessionState::Error => ConversationStatus::Error,
            _ if self.turn_in_flight => ConversationStatus::Busy,
            _ => ConversationStatus::Idle,
        };
        self.conversation.set_status(status);
    }

    /// A turn was started and has not reached `done`, `error`, or a stop.
    pub fn turn_in_flight(&self) -> bool {
        self.turn_in_flight
    }

    // ------------------------------------------------------------------
    // Local intents
    // ------------------------------------------------------------------

    /// Show the user's message right away; returns its client id.
    pub fn begin_send(&mut self, text: &str) -> Result<String, SessionError> {
        let client_id = self.optimistic.begin(&mut self.engine, text)?;
        self.turn_in_flight = true;
        self.conversation.touch();
        Ok(client_id)
    }

    pub fn rollback_send(&mut self) -> Option<PendingSend> {
        let rolled = self.optimistic.rollback(&mut self.engine);
        if rolled.is_some() {
            self.turn_in_flight = false;
        }
        rolled
    }

    pub fn mark_turn_started(&mut self) {
        self.engine.resume_stopped();
        self.turn_in_flight = true;
    }

    /// Stop or disconnect: freeze whatever is streaming, keep everything.
    pub fn freeze(&mut self) {
        let frozen = self.engine.freeze_streaming();
        if frozen > 0 {
            tracing::debug!(
                conversation_id = %self.conversation.id,
                frozen,
                "Froze streaming messages"
            );
        }
    }

    /// User stop: the turn is over as far as the client is concerned.
    pub fn stop_turn(&mut self) {
        let frozen = self.engine.stop_streaming();
        if frozen > 0 {
            tracing::debug!(
                conversation_id = %self.conversation.id,
                frozen,
                "Stopped streaming messages"
            );
        }
        self.optimistic.confirm(&mut self.engine);
        self.turn_in_flight = false;
    }

    // ------------------------------------------------------------------
    // Server events
    // ------------------------------------------------------------------

    pub fn apply(&mut self, event: &ServerEvent) -> ContextEffect {
        match event {
            ServerEvent::Connected(_) => ContextEffect::Connected,

            ServerEvent::MessageStart(e) => {
                if self.optimistic.has_pending() {
                    if e.role == Role::User {
                        self.optimistic
                            .confirm_canonical(&mut self.engine, &e.message_id, None);
                    } else {
                        self.optimistic.confirm(&mut self.engine);
                    }
                }
                self.acknowledge_resume();
                self.turn_in_flight = true;
                self.engine.message_start(e);
                ContextEffect::Activity
            }
            ServerEvent::MessageDelta(e) => {
                self.engine.message_delta(e);
                ContextEffect::Activity
            }
            ServerEvent::MessageEnd(e) => {
                self.engine.message_end(e, self.interrupt.is_active());
                ContextEffect::Activity
            }
            ServerEvent::ToolCallStart(e) => {
                self.acknowledge_resume();
                self.turn_in_flight = true;
                self.engine.tool_call_start(e, self.interrupt.is_active());
                ContextEffect::Activity
            }
            ServerEvent::ToolCallArgsDelta(e) => activity(self.engine.tool_call_args_delta(e)),
            ServerEvent::ToolCallResult(e) => {
                self.acknowledge_resume();
                activity(self.engine.tool_call_result(e))
            }
            ServerEvent::SubagentStart(e) => {
                self.acknowledge_resume();
                self.turn_in_flight = true;
                self.engine.subagent_start(e, self.interrupt.is_active());
                ContextEffect::Activity
            }
            ServerEvent::SubagentUpdate(e) => activity(self.engine.subagent_update(e)),
            ServerEvent::SubagentEnd(e) => activity(self.engine.subagent_end(e)),

            ServerEvent::TodoUpdate(e) => {
                self.todos = e.todos.clone();
                ContextEffect::None
            }
            ServerEvent::FileUpdate(e) => {
                let artifact = e.clone().into_artifact();
                self.files.insert(artifact.path.clone(), artifact);
                ContextEffect::None
            }

            ServerEvent::Interrupt(e) => self.capture_interrupt(e),

            ServerEvent::StateUpdate(e) => {
                if let Some(messages) = &e.messages {
                    self.engine
                        .replace_all(messages.clone(), self.interrupt.is_active());
                    self.optimistic.reconcile_snapshot(&mut self.engine);
                }
                if let Some(todos) = &e.todos {
                    self.todos = todos.clone();
                }
                if let Some(files) = &e.files {
                    self.replace_files(files.clone());
                }
                ContextEffect::None
            }

            ServerEvent::Error(e) => {
                let rolled_back = self.optimistic.rollback(&mut self.engine);
                if self.interrupt.is_active() || self.interrupt.is_resuming() {
                    let failed = self.engine.fail_interrupted(&e.message);
                    tracing::debug!(
                        conversation_id = %self.conversation.id,
                        failed,
                        "Turn aborted while interrupted"
                    );
                }
                self.interrupt.clear();
                self.engine.freeze_streaming();
                self.turn_in_flight = false;
                ContextEffect::ServerError {
                    error: e.clone(),
                    rolled_back,
                }
            }

            ServerEvent::Done => {
                self.optimistic.confirm(&mut self.engine);
                self.acknowledge_resume();
                self.engine.finish_turn();
                self.turn_in_flight = false;
                ContextEffect::TurnCompleted
            }
        }
    }

    fn acknowledge_resume(&mut self) {
        if let Some(resolved) = self.interrupt.acknowledge() {
            tracing::debug!(
                conversation_id = %self.conversation.id,
                interrupt_id = %resolved.id,
                "Resume acknowledged"
            );
        }
    }

    fn capture_interrupt(&mut self, event: &InterruptEvent) -> ContextEffect {
        let request = InterruptRequest {
            id: event.interrupt_id.clone(),
            reason: event.reason.clone(),
            action_requests: event.action_requests.clone(),
            review_configs: event.review_configs.clone(),
            value: event.value.clone(),
        };
        let fresh = self.interrupt.capture(request.clone());
        if fresh {
            let marked = self.engine.mark_interrupted();
            tracing::debug!(
                conversation_id = %self.conversation.id,
                interrupt_id = %request.id,
                marked,
                "Turn interrupted"
            );
        }
        self.engine.freeze_streaming();
        ContextEffect::Interrupted { request, fresh }
    }

    fn replace_files(&mut self, files: Vec<FileArtifact>) {
        self.files = files
            .into_iter()
            .map(|file| (file.path.clone(), file))
            .collect();
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn history_complete(&self) -> bool {
        self.history.complete
    }

    pub fn history_started(&self) -> bool {
        self.history.started
    }

    pub fn history_cursor(&self) -> Option<&str> {
        self.history.next_cursor.as_deref()
    }

    /// Nothing stored server-side yet (a conversation created this session).
    pub fn mark_history_complete(&mut self) {
        self.history.started = true;
        self.history.complete = true;
        self.history.next_cursor = None;
    }

    /// Fold one history page in front of any live messages.
    pub fn apply_history_page(&mut self, page: HistoryPage) {
        self.history.started = true;
        let interrupt_active = self.interrupt.is_active() || page.interrupt.is_some();
        if let Some(interrupt) = page.interrupt {
            self.interrupt.capture(interrupt);
        }
        let (inserted, misses) =
            self.engine
                .ingest_history(page.messages, self.history.placed, interrupt_active);
        self.history.placed += inserted;
        if !misses.is_empty() {
            tracing::warn!(
                conversation_id = %self.conversation.id,
                misses = misses.len(),
                "History page carried unmatched tool results"
            );
        }
        if interrupt_active {
            self.engine.mark_interrupted();
        }
        if let Some(todos) = page.todos {
            self.todos = todos;
        }
        if let Some(files) = page.files {
            self.replace_files(files);
        }
        self.history.complete = page.next_cursor.is_none();
        self.history.next_cursor = page.next_cursor;
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Action request awaiting a decision for this tool call, if any.
    pub fn approval_for(&self, tool_call_id: &str) -> Option<&ActionRequest> {
        let call = self.engine.find_tool_call(tool_call_id)?;
        if call.status != ToolCallStatus::Interrupted {
            return None;
        }
        self.interrupt.action(&call.name)
    }

    pub fn turns(&self, display: &DisplaySettings) -> Vec<Turn> {
        let mut turns = self.engine.turns();
        if !display.group_by_role {
            for turn in &mut turns {
                turn.show_avatar = true;
            }
        }
        turns
    }

    pub fn snapshot(&self, display: &DisplaySettings) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation: self.conversation.clone(),
            turns: self.turns(display),
            todos: self.todos.clone(),
            files: self.files.values().cloned().collect(),
            interrupt: self.interrupt.active().cloned(),
            state: self.connection_state,
            send_pending: self.optimistic.has_pending(),
            history_complete: self.history.complete,
        }
    }
}

/// Immutable view handed to the host for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub turns: Vec<Turn>,
    pub todos: Vec<TodoItem>,
    pub files: Vec<FileArtifact>,
    pub interrupt: Option<InterruptRequest>,
    pub state: SessionState,
    /// Submit should be disabled while true
    pub send_pending: bool,
    pub history_complete: bool,
}

/// Every conversation visited this session, plus which one is active.
#[derive(Debug, Default)]
pub struct ConversationContextStore {
    contexts: HashMap<ConversationId, ConversationContext>,
    active: Option<ConversationId>,
    delegation_tools: Vec<String>,
}

impl ConversationContextStore {
    pub fn new(delegation_tools: Vec<String>) -> Self {
        Self {
            contexts: HashMap::new(),
            active: None,
            delegation_tools,
        }
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationContext> {
        self.contexts.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut ConversationContext> {
        self.contexts.get_mut(id)
    }

    /// Context for `id`, created empty on first visit.
    pub fn get_or_create(&mut self, id: &ConversationId) -> &mut ConversationContext {
        let delegation_tools = &self.delegation_tools;
        self.contexts.entry(id.clone()).or_insert_with(|| {
            ConversationContext::new(
                Conversation::new(id.clone(), String::new()),
                delegation_tools.clone(),
            )
        })
    }

    /// Register a conversation the backend just created.
    pub fn insert(&mut self, conversation: Conversation) -> &mut ConversationContext {
        let id = conversation.id.clone();
        let delegation_tools = self.delegation_tools.clone();
        let context = self
            .contexts
            .entry(id)
            .or_insert_with(|| ConversationContext::new(conversation.clone(), delegation_tools));
        context.conversation = conversation;
        context
    }

    pub fn active_id(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<&ConversationContext> {
        self.active.as_ref().and_then(|id| self.contexts.get(id))
    }

    pub fn active_mut(&mut self) -> Option<&mut ConversationContext> {
        let id = self.active.as_ref()?;
        self.contexts.get_mut(id)
    }

    pub fn set_active(&mut self, id: &ConversationId) -> &mut ConversationContext {
        self.active = Some(id.clone());
        self.get_or_create(id)
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.active.as_ref() == Some(id)
    }

    /// Drop a conversation's context; clears the active pointer if it was
    /// the active one.
    pub fn evict(&mut self, id: &ConversationId) -> Option<ConversationContext> {
        if self.is_active(id) {
            self.active = None;
        }
        self.contexts.remove(id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contexts_mut(&mut self) -> impl Iterator<Item = &mut ConversationContext> {
        self.contexts.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.contexts.keys()
    }
}
