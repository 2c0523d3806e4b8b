use std::collections::HashMap;

use crate::model::{ActionRequest, Decision, DecisionScope, InterruptRequest, ResumeRequest, ReviewConfig};
use crate::session::error::SessionError;

/// Resume decisions ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePlan {
    pub interrupt_id: String,
    /// One per action request, in request order
    pub decisions: Vec<Decision>,
}

/// Holds the single interrupt a conversation may be suspended on.
///
/// Resuming moves the interrupt out of the active slot straight away (the
/// UI stops offering a decision) but keeps it as `resuming` until the
/// server shows it moved on, so a second resume is rejected.
#[derive(Debug, Clone, Default)]
pub struct InterruptCoordinator {
    active: Option<InterruptRequest>,
    resuming: Option<InterruptRequest>,
    by_action: HashMap<String, usize>,
    review_by_action: HashMap<String, usize>,
}

impl InterruptCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interrupt. Returns false for a replay of the one already
    /// active.
    pub fn capture(&mut self, request: InterruptRequest) -> bool {
        if let Some(active) = &self.active {
            if active.id == request.id {
                return false;
            }
            tracing::warn!(
                previous = %active.id,
                next = %request.id,
                "New interrupt replaces unresolved one"
            );
        }
        if self
            .resuming
            .as_ref()
            .is_some_and(|resuming| resuming.id == request.id)
        {
            // Replay of the interrupt we are already answering.
            return false;
        }

        self.by_action.clear();
        for (i, action) in request.action_requests.iter().enumerate() {
            self.by_action.entry(action.name.clone()).or_insert(i);
        }
        self.review_by_action.clear();
        for (i, config) in request.review_configs.iter().enumerate() {
            self.review_by_action
                .entry(config.action_name.clone())
                .or_insert(i);
        }
        self.resuming = None;
        self.active = Some(request);
        true
    }

    pub fn active(&self) -> Option<&InterruptRequest> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming.is_some()
    }

    pub fn action(&self, name: &str) -> Option<&ActionRequest> {
        let active = self.active.as_ref()?;
        self.by_action
            .get(name)
            .map(|&i| &active.action_requests[i])
    }

    pub fn review_config(&self, name: &str) -> Option<&ReviewConfig> {
        let active = self.active.as_ref()?;
        self.review_by_action
            .get(name)
            .map(|&i| &active.review_configs[i])
    }

    /// Validate a resume request and expand it to one decision per action.
    pub fn begin_resume(&mut self, request: &ResumeRequest) -> Result<ResumePlan, SessionError> {
        if let Some(resuming) = &self.resuming {
            return Err(SessionError::ResumeAlreadyPending {
                interrupt_id: resuming.id.clone(),
            });
        }
        let Some(active) = &self.active else {
            return Err(SessionError::NoActiveInterrupt);
        };

        // An interrupt without action requests still takes one decision.
        let expected = active.action_requests.len().max(1);
        let decisions = match &request.scope {
            DecisionScope::All(decision) => vec![decision.clone(); expected],
            DecisionScope::PerAction(decisions) => {
                if decisions.len() != expected {
                    return Err(SessionError::DecisionCountMismatch {
                        expected,
                        actual: decisions.len(),
                    });
                }
                decisions.clone()
            }
        };

        for (action, decision) in active.action_requests.iter().zip(&decisions) {
            if let Some(config) = self.review_config(&action.name) {
                if !config.allows(decision.kind()) {
                    return Err(SessionError::DecisionNotAllowed {
                        action: action.name.clone(),
                        kind: decision.kind(),
                    });
                }
            }
        }

        let interrupt_id = active.id.clone();
        self.resuming = self.active.take();
        Ok(ResumePlan {
            interrupt_id,
            decisions,
        })
    }

    /// The server moved on after a resume.
    pub fn acknowledge(&mut self) -> Option<InterruptRequest> {
        self.resuming.take()
    }

    /// Resume could not be sent; the interrupt is active again.
    pub fn abort_resume(&mut self) {
        if let Some(resuming) = self.resuming.take() {
            self.active = Some(resuming);
        }
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.resuming = None;
        self.by_action.clear();
        self.review_by_action.clear();
    }
}
