//! Session lifecycle: owns the transport, routes decoded events into
//! per-conversation contexts and drives reconnects.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, AuthProvider, ConversationApi, HistoryPage};
use crate::config::Config;
use crate::model::{Conversation, ConversationId, ResumeRequest};
use crate::protocol::{ClientAction, EventDecoder, EventEnvelope, ServerEvent};
use crate::session::backoff::ReconnectPolicy;
use crate::session::context::{ContextEffect, ConversationContextStore, ConversationSnapshot};
use crate::session::error::SessionError;
use crate::session::handle::{SessionCommand, SessionEvent};
use crate::session::state::SessionState;
use crate::transport::{Transport, TransportError, TransportSignal};

/// One fetched history page, tagged with the load that produced it.
struct HistoryLoad {
    generation: u64,
    conversation_id: ConversationId,
    page: Result<HistoryPage, ApiError>,
}

pub struct SessionController {
    transport: Box<dyn Transport>,
    api: Arc<dyn ConversationApi>,
    auth: Arc<dyn AuthProvider>,
    config: Config,
    store: ConversationContextStore,
    state: SessionState,
    decoder: EventDecoder,
    signals: Option<mpsc::Receiver<TransportSignal>>,
    policy: ReconnectPolicy,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    /// Returning connection continues the active conversation instead of
    /// starting it over
    resume_on_connect: bool,
    /// Set by a user stop until the turn settles or a new one starts
    stop_requested: bool,
    initialized: bool,
    events: broadcast::Sender<SessionEvent>,
    history_cancel: Arc<Mutex<CancellationToken>>,
    history_generation: u64,
    history_tx: mpsc::Sender<HistoryLoad>,
    history_rx: mpsc::Receiver<HistoryLoad>,
}

impl SessionController {
    pub fn new(
        transport: Box<dyn Transport>,
        api: Arc<dyn ConversationApi>,
        auth: Arc<dyn AuthProvider>,
        config: Config,
    ) -> Self {
        let buffer = config.connection.event_buffer;
        let (events, _) = broadcast::channel(buffer);
        let (history_tx, history_rx) = mpsc::channel(8);
        Self {
            transport,
            api,
            auth,
            store: ConversationContextStore::new(config.correlation.delegation_tools.clone()),
            policy: ReconnectPolicy::from(&config.reconnect),
            config,
            state: SessionState::Disconnected,
            decoder: EventDecoder::new(),
            signals: None,
            reconnect_attempt: 0,
            reconnect_at: None,
            resume_on_connect: false,
            stop_requested: false,
            initialized: false,
            events,
            history_cancel: Arc::new(Mutex::new(CancellationToken::new())),
            history_generation: 0,
            history_tx,
            history_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub(crate) fn history_cancel(&self) -> Arc<Mutex<CancellationToken>> {
        self.history_cancel.clone()
    }

    pub(crate) fn command_buffer(&self) -> usize {
        self.config.connection.event_buffer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &ConversationContextStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn snapshot(&self) -> Option<ConversationSnapshot> {
        self.store
            .active()
            .map(|ctx| ctx.snapshot(&self.config.display))
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                signal = next_signal(&mut self.signals) => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => self.on_signals_closed(),
                },
                Some(load) = self.history_rx.recv() => self.apply_history(load),
                _ = sleep_until(self.reconnect_at) => self.attempt_reconnect().await,
            }
        }
        tracing::debug!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect(reply) => {
                let _ = reply.send(self.initialize().await);
            }
            SessionCommand::Reconnect(reply) => {
                let _ = reply.send(self.reconnect().await);
            }
            SessionCommand::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(&text).await);
            }
            SessionCommand::ResumeInterrupt { request, reply } => {
                let _ = reply.send(self.resume_interrupt(request).await);
            }
            SessionCommand::StopStream(reply) => match self.stop_locally() {
                Ok(id) => {
                    let _ = reply.send(Ok(()));
                    self.request_stop(id).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionCommand::ContinueStream(reply) => {
                let _ = reply.send(self.continue_stream().await);
            }
            SessionCommand::SwitchConversation { id, reply } => {
                let _ = reply.send(self.switch_conversation(id).await);
            }
            SessionCommand::CreateConversation { title, reply } => {
                let _ = reply.send(self.create_conversation(title).await);
            }
            SessionCommand::DeleteConversation { id, reply } => {
                let _ = reply.send(self.delete_conversation(id).await);
            }
            SessionCommand::State(reply) => {
                let _ = reply.send(self.state);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// First connect. Repeated calls are no-ops.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        if self.initialized {
            tracing::debug!("Session already initialized");
            return Ok(());
        }
        self.initialized = true;
        self.connect().await
    }

    /// Open the transport. A missing token is reported as `NotReady`, not
    /// as an error.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.initialized = true;
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        match self.open_connection().await {
            Ok(()) | Err(SessionError::NotReady) => Ok(()),
            Err(e) => {
                self.on_connect_failed(&e);
                Err(e)
            }
        }
    }

    /// Explicit reconnect; the only way out of `Error`.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        if self.transport.is_connected() {
            self.transport.close().await;
        }
        self.signals = None;
        self.resume_on_connect = true;
        self.connect().await
    }

    async fn open_connection(&mut self) -> Result<(), SessionError> {
        let Some(token) = self.auth.token() else {
            tracing::debug!("No auth token yet; not connecting");
            self.emit(SessionEvent::NotReady);
            return Err(SessionError::NotReady);
        };
        self.signals = None;
        self.set_state(SessionState::Connecting);

        let endpoint = self.config.connection.endpoint.clone();
        tracing::debug!(
            endpoint = %endpoint,
            mode = self.transport.mode().as_str(),
            attempt = self.reconnect_attempt,
            "Connecting"
        );
        let signals = self.transport.connect(&endpoint, &token).await?;
        self.signals = Some(signals);
        Ok(())
    }

    fn on_connect_failed(&mut self, error: &SessionError) {
        match error {
            SessionError::Transport(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "Connect failed");
                self.set_state(SessionState::Disconnected);
                self.schedule_reconnect();
            }
            _ => {
                tracing::error!(error = %error, kind = ?error.kind(), "Connect failed permanently");
                self.set_state(SessionState::Error);
                self.surface(None, error);
            }
        }
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        match self.open_connection().await {
            Ok(()) => {}
            Err(SessionError::NotReady) => {
                self.set_state(SessionState::Disconnected);
                self.schedule_reconnect();
            }
            Err(e) => self.on_connect_failed(&e),
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;
        match self.policy.next_delay(attempt) {
            Some(delay) => {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                self.reconnect_at = None;
                let exhausted = SessionError::ReconnectExhausted {
                    attempts: self.policy.max_attempts,
                };
                self.report(None, &exhausted);
            }
        }
    }

    /// Handshake acknowledged: re-point the server at the active
    /// conversation and pick an unfinished turn back up.
    async fn on_connected(&mut self) {
        let resuming = std::mem::take(&mut self.resume_on_connect);
        self.reconnect_attempt = 0;
        self.reconnect_at = None;

        let Some(id) = self.store.active_id().cloned() else {
            self.set_state(SessionState::IDLE);
            return;
        };
        let (interrupted, in_flight) = match self.store.get(&id) {
            Some(ctx) => (ctx.interrupt().is_active(), ctx.turn_in_flight()),
            None => (false, false),
        };
        self.set_state(if interrupted {
            SessionState::Interrupted
        } else {
            SessionState::IDLE
        });

        let subscribe = ClientAction::Subscribe {
            conversation_id: id.clone(),
        };
        if let Err(e) = self.send_action(&subscribe).await {
            tracing::warn!(conversation_id = %id, error = %e, "Subscribe failed");
            return;
        }

        if resuming && in_flight && !interrupted && !self.stop_requested {
            tracing::debug!(conversation_id = %id, "Continuing interrupted turn after reconnect");
            let action = ClientAction::ContinueStream {
                conversation_id: id.clone(),
            };
            match self.send_action(&action).await {
                Ok(()) => self.set_state(SessionState::STREAMING),
                Err(e) => tracing::warn!(conversation_id = %id, error = %e, "Continue failed"),
            }
        }
    }

    fn on_transport_lost(&mut self, reason: &str) {
        tracing::warn!(reason = %reason, state = %self.state, "Transport lost");
        self.signals = None;
        for ctx in self.store.contexts_mut() {
            ctx.freeze();
        }
        if self.state == SessionState::Error {
            return;
        }
        self.set_state(SessionState::Disconnected);
        self.resume_on_connect = true;
        self.schedule_reconnect();
    }

    fn on_signals_closed(&mut self) {
        self.signals = None;
        if self.state.is_connected() || self.state == SessionState::Connecting {
            self.on_transport_lost("event stream closed");
        }
    }

    async fn shutdown(&mut self) {
        self.history_cancel.lock().cancel();
        self.reconnect_at = None;
        self.signals = None;
        self.transport.close().await;
        self.set_state(SessionState::Disconnected);
    }

    // ------------------------------------------------------------------
    // Incoming events
    // ------------------------------------------------------------------

    async fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Opened => {
                tracing::debug!(mode = self.transport.mode().as_str(), "Transport opened");
            }
            TransportSignal::Frame(raw) => match self.decoder.decode(&raw) {
                Ok(Some(envelope)) => self.apply_envelope(envelope).await,
                Ok(None) => {}
                Err(e) => self.report(None, &e.into()),
            },
            TransportSignal::NamedFrame { event, data } => {
                match self.decoder.decode_named(&event, &data) {
                    Ok(Some(envelope)) => self.apply_envelope(envelope).await,
                    Ok(None) => {}
                    Err(e) => self.report(None, &e.into()),
                }
            }
            TransportSignal::Lost { reason } => self.on_transport_lost(&reason),
        }
    }

    /// Apply one decoded event to the conversation it belongs to.
    pub async fn apply_envelope(&mut self, envelope: EventEnvelope) {
        let EventEnvelope {
            event,
            conversation_id,
            ..
        } = envelope;

        if matches!(event, ServerEvent::Connected(_)) {
            if self.state == SessionState::Connecting {
                self.on_connected().await;
            }
            return;
        }

        let Some(id) = conversation_id.or_else(|| self.store.active_id().cloned()) else {
            tracing::debug!(
                event = event.event_type_name(),
                "Dropping event with no conversation"
            );
            return;
        };
        let is_active = self.store.is_active(&id);
        tracing::debug!(
            conversation_id = %id,
            event = event.event_type_name(),
            active = is_active,
            "Routing event"
        );
        let effect = self.store.get_or_create(&id).apply(&event);

        if is_active {
            self.apply_effect(&id, effect);
        } else if let ContextEffect::ServerError { error, .. } = &effect {
            tracing::error!(conversation_id = %id, message = %error.message, "Server error");
        }
        self.emit(SessionEvent::ConversationUpdated {
            conversation_id: id,
        });
    }

    fn apply_effect(&mut self, id: &ConversationId, effect: ContextEffect) {
        match effect {
            ContextEffect::None | ContextEffect::Connected => {}
            ContextEffect::Unmatched(miss) => self.report(Some(id), &miss.into()),
            ContextEffect::Activity => {
                if self.state == SessionState::IDLE && !self.stop_requested {
                    self.set_state(SessionState::STREAMING);
                }
            }
            ContextEffect::Interrupted { request, fresh } => {
                self.set_state(SessionState::Interrupted);
                if fresh {
                    self.emit(SessionEvent::InterruptRaised {
                        conversation_id: id.clone(),
                        request,
                    });
                }
            }
            ContextEffect::ServerError { error, rolled_back } => {
                self.stop_requested = false;
                if let Some(pending) = rolled_back {
                    let mismatch = SessionError::OptimisticMismatch {
                        message_id: pending.client_id,
                        reason: error.message.clone(),
                    };
                    self.report(Some(id), &mismatch);
                    self.emit(SessionEvent::SendFailed {
                        conversation_id: id.clone(),
                        text: pending.text,
                        reason: error.message.clone(),
                        kind: mismatch.kind(),
                    });
                }
                let unrecoverable = error.is_unrecoverable();
                let server = SessionError::Server {
                    message: error.message,
                    code: error.code,
                };
                self.report(Some(id), &server);
                if unrecoverable {
                    self.reconnect_at = None;
                    self.set_state(SessionState::Error);
                } else if self.state.is_connected() {
                    self.set_state(SessionState::IDLE);
                }
            }
            ContextEffect::TurnCompleted => {
                self.stop_requested = false;
                if self.state.is_connected() {
                    self.set_state(SessionState::IDLE);
                }
                self.emit(SessionEvent::TurnCompleted {
                    conversation_id: id.clone(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Client intents
    // ------------------------------------------------------------------

    /// Show the message optimistically and send it. Creates a conversation
    /// first when none is active. Returns the optimistic message's id.
    pub async fn send_message(&mut self, text: &str) -> Result<String, SessionError> {
        self.ensure_connected()?;
        if self.state == SessionState::Interrupted {
            return Err(SessionError::InterruptPending);
        }
        let id = match self.store.active_id() {
            Some(id) => id.clone(),
            None => self.create_conversation(None).await?.id,
        };

        let client_id = self
            .store
            .get_or_create(&id)
            .begin_send(text)?;
        self.emit(SessionEvent::ConversationUpdated {
            conversation_id: id.clone(),
        });

        let action = ClientAction::SendMessage {
            conversation_id: id.clone(),
            message_id: client_id.clone(),
            content: text.to_string(),
        };
        if let Err(e) = self.send_action(&action).await {
            if let Some(ctx) = self.store.get_mut(&id) {
                ctx.rollback_send();
            }
            let error = SessionError::from(e);
            self.report(Some(&id), &error);
            self.emit(SessionEvent::SendFailed {
                conversation_id: id.clone(),
                text: text.to_string(),
                reason: error.to_string(),
                kind: error.kind(),
            });
            self.emit(SessionEvent::ConversationUpdated {
                conversation_id: id,
            });
            return Err(error);
        }

        self.stop_requested = false;
        self.set_state(SessionState::STREAMING);
        Ok(client_id)
    }

    /// Answer the active interrupt. Exactly one resume per interrupt.
    pub async fn resume_interrupt(&mut self, request: ResumeRequest) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let id = self.active_id()?;
        let plan = self
            .store
            .get_or_create(&id)
            .interrupt_mut()
            .begin_resume(&request)?;

        tracing::debug!(
            conversation_id = %id,
            interrupt_id = %plan.interrupt_id,
            decisions = plan.decisions.len(),
            "Resuming interrupt"
        );
        let action = ClientAction::ResumeInterrupt {
            conversation_id: id.clone(),
            interrupt_id: plan.interrupt_id,
            decisions: plan.decisions,
        };
        if let Err(e) = self.send_action(&action).await {
            if let Some(ctx) = self.store.get_mut(&id) {
                ctx.interrupt_mut().abort_resume();
            }
            return Err(e.into());
        }

        self.stop_requested = false;
        if let Some(ctx) = self.store.get_mut(&id) {
            ctx.mark_turn_started();
        }
        self.set_state(SessionState::STREAMING);
        self.emit(SessionEvent::ConversationUpdated {
            conversation_id: id,
        });
        Ok(())
    }

    /// Go idle now, then ask the server to abort the turn.
    pub async fn stop_stream(&mut self) -> Result<(), SessionError> {
        let id = self.stop_locally()?;
        self.request_stop(id).await;
        Ok(())
    }

    fn stop_locally(&mut self) -> Result<ConversationId, SessionError> {
        let id = self.active_id()?;
        self.stop_requested = true;
        if let Some(ctx) = self.store.get_mut(&id) {
            ctx.stop_turn();
        }
        if self.state.is_streaming() {
            self.set_state(SessionState::IDLE);
        }
        self.emit(SessionEvent::ConversationUpdated {
            conversation_id: id.clone(),
        });
        Ok(id)
    }

    async fn request_stop(&mut self, id: ConversationId) {
        if !self.transport.is_connected() {
            return;
        }
        let action = ClientAction::StopStream {
            conversation_id: id.clone(),
        };
        let timeout = self.config.connection.stop_timeout();
        if let Err(e) = self.send_action_within(&action, timeout).await {
            tracing::warn!(conversation_id = %id, error = %e, "Stop request not delivered");
        }
    }

    pub async fn continue_stream(&mut self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let id = self.active_id()?;
        if self
            .store
            .get(&id)
            .is_some_and(|ctx| ctx.interrupt().is_active())
        {
            return Err(SessionError::InterruptPending);
        }
        let action = ClientAction::ContinueStream {
            conversation_id: id.clone(),
        };
        self.send_action(&action).await?;
        self.stop_requested = false;
        if let Some(ctx) = self.store.get_mut(&id) {
            ctx.mark_turn_started();
        }
        self.set_state(SessionState::STREAMING);
        Ok(())
    }

    /// Make `id` the active conversation. The previous one keeps its
    /// context; only its live stream is cancelled.
    pub async fn switch_conversation(&mut self, id: ConversationId) -> Result<(), SessionError> {
        if self.store.is_active(&id) {
            return Ok(());
        }

        if let Some(previous) = self.store.active_id().cloned() {
            let in_flight = self
                .store
                .get(&previous)
                .is_some_and(|ctx| ctx.turn_in_flight());
            if in_flight || self.state.is_streaming() {
                self.stop_locally()?;
                self.request_stop(previous).await;
            }
        }
        self.cancel_progressive_load();
        self.stop_requested = false;

        tracing::debug!(conversation_id = %id, "Switching conversation");
        let (interrupted, load_from) = {
            let ctx = self.store.set_active(&id);
            let load_from = if ctx.history_complete() {
                None
            } else {
                Some(ctx.history_cursor().map(str::to_string))
            };
            (ctx.interrupt().is_active(), load_from)
        };
        if let Some(cursor) = load_from {
            self.start_history_load(id.clone(), cursor);
        }

        if self.state.is_connected() {
            self.set_state(if interrupted {
                SessionState::Interrupted
            } else {
                SessionState::IDLE
            });
            let subscribe = ClientAction::Subscribe {
                conversation_id: id.clone(),
            };
            if let Err(e) = self.send_action(&subscribe).await {
                tracing::warn!(conversation_id = %id, error = %e, "Subscribe failed");
            }
        } else {
            let state = self.state;
            if let Some(ctx) = self.store.active_mut() {
                ctx.set_connection_state(state);
            }
            if self.initialized
                && self.state == SessionState::Disconnected
                && self.reconnect_at.is_none()
            {
                self.connect().await?;
            }
        }

        self.emit(SessionEvent::ConversationUpdated {
            conversation_id: id,
        });
        Ok(())
    }

    /// Create a conversation on the backend and switch to it.
    pub async fn create_conversation(
        &mut self,
        title: Option<String>,
    ) -> Result<Conversation, SessionError> {
        let conversation = self.api.create_conversation(title).await?;
        tracing::debug!(conversation_id = %conversation.id, "Conversation created");
        self.store.insert(conversation.clone()).mark_history_complete();
        self.emit(SessionEvent::ConversationCreated(conversation.clone()));
        self.switch_conversation(conversation.id.clone()).await?;
        Ok(conversation)
    }

    /// Delete on the backend and evict the cached context.
    pub async fn delete_conversation(&mut self, id: ConversationId) -> Result<(), SessionError> {
        self.api.delete_conversation(&id).await?;
        if self.store.is_active(&id) {
            self.cancel_progressive_load();
            if self.state.is_connected() {
                self.set_state(SessionState::IDLE);
            }
        }
        self.store.evict(&id);
        tracing::debug!(conversation_id = %id, "Conversation deleted");
        self.emit(SessionEvent::ConversationDeleted(id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Stop paging in history for the active conversation. Pages already
    /// applied stay.
    pub fn cancel_progressive_load(&self) {
        self.history_cancel.lock().cancel();
    }

    fn start_history_load(&mut self, id: ConversationId, cursor: Option<String>) {
        let token = CancellationToken::new();
        {
            let mut current = self.history_cancel.lock();
            current.cancel();
            *current = token.clone();
        }
        self.history_generation += 1;
        let generation = self.history_generation;
        let api = self.api.clone();
        let tx = self.history_tx.clone();
        let limit = self.config.history.page_size;

        tokio::spawn(async move {
            let mut cursor = cursor;
            loop {
                let page = tokio::select! {
                    _ = token.cancelled() => break,
                    page = api.fetch_history(&id, cursor.as_deref(), limit) => page,
                };
                if token.is_cancelled() {
                    break;
                }
                let next = match &page {
                    Ok(page) => page.next_cursor.clone(),
                    Err(_) => None,
                };
                let load = HistoryLoad {
                    generation,
                    conversation_id: id.clone(),
                    page,
                };
                if tx.send(load).await.is_err() {
                    break;
                }
                match next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        });
    }

    fn apply_history(&mut self, load: HistoryLoad) {
        if load.generation != self.history_generation {
            tracing::debug!(conversation_id = %load.conversation_id, "Dropping stale history page");
            return;
        }
        let page = match load.page {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %load.conversation_id,
                    error = %e,
                    "History fetch failed"
                );
                return;
            }
        };
        let Some(ctx) = self.store.get_mut(&load.conversation_id) else {
            return;
        };
        let captured_interrupt = page.interrupt.clone();
        let was_interrupted = ctx.interrupt().is_active();
        ctx.apply_history_page(page);
        tracing::debug!(
            conversation_id = %load.conversation_id,
            messages = ctx.engine().len(),
            complete = ctx.history_complete(),
            "History page applied"
        );

        if self.store.is_active(&load.conversation_id) {
            if let Some(request) = captured_interrupt.filter(|_| !was_interrupted) {
                if self.state.is_connected() {
                    self.set_state(SessionState::Interrupted);
                }
                self.emit(SessionEvent::InterruptRaised {
                    conversation_id: load.conversation_id.clone(),
                    request,
                });
            }
        }
        self.emit(SessionEvent::ConversationUpdated {
            conversation_id: load.conversation_id,
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_connected(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected | SessionState::Connecting | SessionState::Error => {
                Err(SessionError::NotConnected)
            }
            _ => Ok(()),
        }
    }

    fn active_id(&self) -> Result<ConversationId, SessionError> {
        self.store
            .active_id()
            .cloned()
            .ok_or(SessionError::NoActiveConversation)
    }

    async fn send_action(&mut self, action: &ClientAction) -> Result<(), TransportError> {
        let timeout = self.config.connection.action_timeout();
        self.send_action_within(action, timeout).await
    }

    async fn send_action_within(
        &mut self,
        action: &ClientAction,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        tracing::debug!(
            action = action.action_name(),
            conversation_id = %action.conversation_id(),
            "Sending action"
        );
        match tokio::time::timeout(timeout, self.transport.send(action)).await {
            Ok(Err(TransportError::Unauthorized)) => {
                self.set_state(SessionState::Error);
                Err(TransportError::Unauthorized)
            }
            Ok(result) => result,
            Err(_) => Err(TransportError::Send {
                action: action.action_name().to_string(),
                reason: format!("no response within {}ms", timeout.as_millis()),
            }),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Session state changed");
        self.state = state;
        if let Some(ctx) = self.store.active_mut() {
            ctx.set_connection_state(state);
        }
        self.emit(SessionEvent::StateChanged(state));
    }

    /// Log an error by its kind and surface it to the host when it is one
    /// the user should see.
    fn report(&self, conversation_id: Option<&ConversationId>, error: &SessionError) {
        let kind = error.kind();
        if error.is_user_visible() {
            tracing::error!(conversation_id = ?conversation_id, kind = ?kind, "{error}");
            self.surface(conversation_id, error);
        } else {
            tracing::warn!(conversation_id = ?conversation_id, kind = ?kind, "{error}");
        }
    }

    fn surface(&self, conversation_id: Option<&ConversationId>, error: &SessionError) {
        let event = match error {
            SessionError::ReconnectExhausted { attempts } => SessionEvent::ReconnectExhausted {
                attempts: *attempts,
            },
            SessionError::Server { message, code } => SessionEvent::ServerError {
                conversation_id: conversation_id.cloned(),
                message: message.clone(),
                code: code.clone(),
                kind: error.kind(),
            },
            other => SessionEvent::ServerError {
                conversation_id: conversation_id.cloned(),
                message: other.to_string(),
                code: None,
                kind: other.kind(),
            },
        };
        self.emit(event);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn next_signal(
    signals: &mut Option<mpsc::Receiver<TransportSignal>>,
) -> Option<TransportSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
