//! Rule and policy evaluation results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action a pending rule is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Approval,
    Wait,
}

/// Outcome of one rule for one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    #[serde(default)]
    pub rule_type: String,

    #[serde(default)]
    pub rule_id: String,

    pub allowed: bool,

    pub action_required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,

    pub message: String,

    #[serde(default)]
    pub details: serde_json::Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_evaluation_time: Option<DateTime<Utc>>,
}

impl RuleEvaluation {
    pub fn allowed(message: impl Into<String>) -> Self {
        Self {
            rule_type: String::new(),
            rule_id: String::new(),
            allowed: true,
            action_required: false,
            action_type: None,
            message: message.into(),
            details: serde_json::Map::new(),
            next_evaluation_time: None,
        }
    }

    /// Hard deny; no action will change the outcome for this candidate
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            ..Self::allowed(message)
        }
    }

    /// Blocked until an approval arrives or time passes
    pub fn pending(action_type: ActionType, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            action_required: true,
            action_type: Some(action_type),
            ..Self::allowed(message)
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_next_evaluation_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_evaluation_time = Some(at);
        self
    }

    /// Stamp the producing rule
    pub fn for_rule(mut self, rule_type: &str, rule_id: &str) -> Self {
        self.rule_type = rule_type.to_string();
        self.rule_id = rule_id.to_string();
        self
    }

    pub fn is_hard_deny(&self) -> bool {
        !self.allowed && !self.action_required
    }
}

/// Rule outcomes of one policy for one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvaluation {
    pub policy_id: String,
    pub policy_name: String,
    pub rule_results: Vec<RuleEvaluation>,
}

impl PolicyEvaluation {
    pub fn new(policy_id: impl Into<String>, policy_name: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            policy_name: policy_name.into(),
            rule_results: Vec::new(),
        }
    }

    pub fn add(&mut self, result: RuleEvaluation) {
        self.rule_results.push(result);
    }

    /// Every rule allowed; true for an empty rule list
    pub fn allowed(&self) -> bool {
        self.rule_results.iter().all(|r| r.allowed)
    }

    pub fn has_denials(&self) -> bool {
        self.rule_results.iter().any(|r| !r.allowed)
    }

    pub fn has_pending_actions(&self) -> bool {
        self.rule_results.iter().any(|r| r.action_required)
    }

    pub fn approval_actions(&self) -> Vec<&RuleEvaluation> {
        self.actions_of(ActionType::Approval)
    }

    pub fn wait_actions(&self) -> Vec<&RuleEvaluation> {
        self.actions_of(ActionType::Wait)
    }

    pub fn needs_approval(&self) -> bool {
        !self.approval_actions().is_empty()
    }

    pub fn needs_wait(&self) -> bool {
        !self.wait_actions().is_empty()
    }

    /// Some rule denied outright
    pub fn is_blocked(&self) -> bool {
        self.rule_results.iter().any(RuleEvaluation::is_hard_deny)
    }

    /// Not blocked, but waiting on an action
    pub fn is_pending(&self) -> bool {
        !self.is_blocked() && self.has_pending_actions()
    }

    pub fn can_deploy(&self) -> bool {
        !self.has_denials() && !self.has_pending_actions()
    }

    /// Earliest time a pending or denying rule asked to be re-evaluated
    pub fn next_evaluation_time(&self) -> Option<DateTime<Utc>> {
        self.rule_results
            .iter()
            .filter(|r| !r.allowed)
            .filter_map(|r| r.next_evaluation_time)
            .min()
    }

    fn actions_of(&self, action_type: ActionType) -> Vec<&RuleEvaluation> {
        self.rule_results
            .iter()
            .filter(|r| r.action_required && r.action_type == Some(action_type))
            .collect()
    }
}
