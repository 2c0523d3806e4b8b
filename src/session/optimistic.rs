use std::collections::HashSet;

use uuid::Uuid;

use crate::correlation::CorrelationEngine;
use crate::model::{MessageContent, MessageStatus};
use crate::session::error::SessionError;

/// The one unconfirmed user message a conversation may have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub client_id: String,
    pub text: String,
}

/// Speculatively shows the user's message before the server acknowledges
/// it, then confirms it in place or rolls it back.
#[derive(Debug, Clone, Default)]
pub struct OptimisticUpdateManager {
    pending: Option<PendingSend>,
    /// User messages the server already had when the pending send began
    known_user_ids: HashSet<String>,
}

impl OptimisticUpdateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<&PendingSend> {
        self.pending.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Append the optimistic message and return its client id. A second
    /// send before the first resolves is rejected, never queued.
    pub fn begin(
        &mut self,
        engine: &mut CorrelationEngine,
        text: &str,
    ) -> Result<String, SessionError> {
        if self.pending.is_some() {
            return Err(SessionError::SendInFlight);
        }
        let client_id = format!("local-{}", Uuid::new_v4());
        self.known_user_ids = engine.user_message_ids();
        engine.push_optimistic(&client_id, text);
        self.pending = Some(PendingSend {
            client_id: client_id.clone(),
            text: text.to_string(),
        });
        Ok(client_id)
    }

    /// Server echoed the user message under its own id (and maybe content).
    pub fn confirm_canonical(
        &mut self,
        engine: &mut CorrelationEngine,
        canonical_id: &str,
        content: Option<MessageContent>,
    ) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        tracing::debug!(
            client_id = %pending.client_id,
            canonical_id = %canonical_id,
            "Optimistic message confirmed"
        );
        engine.confirm(&pending.client_id, Some(canonical_id), content)
    }

    /// The turn moved on without echoing the message; keep it as sent.
    pub fn confirm(&mut self, engine: &mut CorrelationEngine) -> bool {
        match self.pending.take() {
            Some(pending) => engine.confirm(&pending.client_id, None, None),
            None => false,
        }
    }

    /// Restore the pending entry after a snapshot replaced the message list.
    /// If the snapshot holds a user message with the same text that the
    /// server did not have when the send began, that copy wins.
    pub fn reconcile_snapshot(&mut self, engine: &mut CorrelationEngine) {
        let Some(pending) = &self.pending else {
            return;
        };
        let echoed = engine
            .message(&pending.client_id)
            .is_some_and(|m| m.status != MessageStatus::Optimistic);
        if echoed
            || engine
                .last_new_user_message_with_text(&pending.text, &self.known_user_ids)
                .is_some()
        {
            tracing::debug!(client_id = %pending.client_id, "Snapshot confirmed optimistic message");
            self.pending = None;
            self.known_user_ids.clear();
        } else if !engine.contains(&pending.client_id) {
            engine.push_optimistic(&pending.client_id, &pending.text);
        }
    }

    /// Remove the unconfirmed message after a failed send.
    pub fn rollback(&mut self, engine: &mut CorrelationEngine) -> Option<PendingSend> {
        let pending = self.pending.take()?;
        engine.remove(&pending.client_id);
        tracing::warn!(client_id = %pending.client_id, "Rolled back optimistic message");
        Some(pending)
    }
}
