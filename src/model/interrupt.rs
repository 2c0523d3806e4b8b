//! Human-in-the-loop interrupt payloads and resume decisions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One action the agent wants a human to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Edit,
    Reject,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Edit => "edit",
            DecisionKind::Reject => "reject",
        }
    }
}

fn all_decisions() -> Vec<DecisionKind> {
    vec![DecisionKind::Approve, DecisionKind::Edit, DecisionKind::Reject]
}

/// Per-action restriction on which decisions the reviewer may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewConfig {
    #[serde(alias = "action_name")]
    pub action_name: String,
    #[serde(default = "all_decisions", alias = "allowed_decisions")]
    pub allowed_decisions: Vec<DecisionKind>,
}

impl ReviewConfig {
    pub fn allows(&self, kind: DecisionKind) -> bool {
        self.allowed_decisions.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    #[serde(alias = "interruptId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub action_requests: Vec<ActionRequest>,
    #[serde(default)]
    pub review_configs: Vec<ReviewConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Edit {
        #[serde(rename = "editedAction")]
        edited_action: ActionRequest,
    },
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Approve => DecisionKind::Approve,
            Decision::Edit { .. } => DecisionKind::Edit,
            Decision::Reject { .. } => DecisionKind::Reject,
        }
    }
}

/// Which pending actions a decision applies to. There is no implicit
/// default: callers say whether one decision covers every action or give
/// one decision per action, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionScope {
    All(Decision),
    PerAction(Vec<Decision>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumeRequest {
    pub scope: DecisionScope,
}

impl ResumeRequest {
    pub fn all(decision: Decision) -> Self {
        Self {
            scope: DecisionScope::All(decision),
        }
    }

    pub fn approve_all() -> Self {
        Self::all(Decision::Approve)
    }

    pub fn reject_all(message: impl Into<String>) -> Self {
        Self::all(Decision::Reject {
            message: Some(message.into()),
        })
    }

    pub fn per_action(decisions: Vec<Decision>) -> Self {
        Self {
            scope: DecisionScope::PerAction(decisions),
        }
    }
}
