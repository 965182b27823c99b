//! Policies, rules and approval records
//!
//! A policy applies to every release target admitted by any of its target
//! selectors and contributes its rules to that target's planning DAG.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use keel_selector::Selector;
use serde::{Deserialize, Serialize};

/// A named rule container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,

    #[serde(default)]
    pub workspace_id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub priority: i64,

    /// Release targets the policy applies to; empty applies to none
    #[serde(default)]
    pub target_selectors: Vec<PolicyTargetSelector>,

    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Policy {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            workspace_id: String::new(),
            name: name.into(),
            description: None,
            enabled: true,
            priority: 0,
            target_selectors: Vec::new(),
            rules: Vec::new(),
            created_at,
        }
    }

    /// Apply the policy to every release target
    pub fn targeting_all(mut self) -> Self {
        self.target_selectors.push(PolicyTargetSelector::default());
        self
    }

    pub fn with_target(mut self, target: PolicyTargetSelector) -> Self {
        self.target_selectors.push(target);
        self
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Triple of selectors; an absent selector admits everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_selector: Option<Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_selector: Option<Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,
}

/// One rule of a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: String,

    #[serde(flatten)]
    pub kind: RuleKind,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Rule sum type, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleKind {
    /// At least `min_approvals` approve records for (version, environment)
    #[serde(rename_all = "camelCase")]
    AnyApproval { min_approvals: u32 },

    /// Version must have succeeded in every environment matched by
    /// `depends_on_environment_selector`
    #[serde(rename_all = "camelCase")]
    EnvironmentProgression {
        depends_on_environment_selector: Selector,
    },

    /// Admit a growing fraction of targets after version creation
    #[serde(rename_all = "camelCase")]
    GradualRollout {
        /// Time until every target is admitted
        rollout_duration_seconds: u64,
        #[serde(default)]
        schedule: RolloutSchedule,
    },

    /// Only versions matching `selector`
    VersionSelector {
        selector: Selector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// Another deployment's current release on the same resource must
    /// exist and, if `version_selector` is set, match it
    #[serde(rename_all = "camelCase")]
    DeploymentDependency {
        depends_on_deployment_selector: Selector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_selector: Option<Selector>,
    },

    /// Weekly UTC windows; `deny` inverts them into blackout windows
    #[serde(rename_all = "camelCase")]
    DeploymentWindow {
        windows: Vec<TimeWindow>,
        #[serde(default)]
        deny: bool,
    },

    /// Minimum time between the reference version and a candidate
    #[serde(rename_all = "camelCase")]
    VersionCooldown { interval_seconds: u64 },

    /// Only `ready` versions
    DeployableVersions {},

    /// Cap on consecutive failed jobs for one release
    #[serde(rename_all = "camelCase")]
    Retry { max_retries: u32 },
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::AnyApproval { .. } => "any-approval",
            RuleKind::EnvironmentProgression { .. } => "environment-progression",
            RuleKind::GradualRollout { .. } => "gradual-rollout",
            RuleKind::VersionSelector { .. } => "version-selector",
            RuleKind::DeploymentDependency { .. } => "deployment-dependency",
            RuleKind::DeploymentWindow { .. } => "deployment-window",
            RuleKind::VersionCooldown { .. } => "version-cooldown",
            RuleKind::DeployableVersions {} => "deployable-versions",
            RuleKind::Retry { .. } => "retry",
        }
    }
}

/// Shape of the gradual rollout admission curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RolloutSchedule {
    Linear,
    /// Admit in `steps` equal increments
    Step { steps: u32 },
}

impl Default for RolloutSchedule {
    fn default() -> Self {
        RolloutSchedule::Linear
    }
}

/// A recurring weekly window, `[start, end)` in UTC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Approve or reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

/// A user's decision on a version for an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserApprovalRecord {
    pub version_id: String,
    pub environment_id: String,
    pub user_id: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserApprovalRecord {
    /// Composite id `versionId + userId`
    pub fn id(&self) -> String {
        crate::ids::approval_record_id(&self.version_id, &self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_wire_format() {
        let rule: PolicyRule = serde_json::from_value(json!({
            "id": "rule-1",
            "type": "any-approval",
            "minApprovals": 2
        }))
        .unwrap();
        assert_eq!(rule.kind, RuleKind::AnyApproval { min_approvals: 2 });

        let rule: PolicyRule = serde_json::from_value(json!({
            "id": "rule-2",
            "type": "gradual-rollout",
            "rolloutDurationSeconds": 600,
            "schedule": {"kind": "step", "steps": 4}
        }))
        .unwrap();
        assert_eq!(rule.kind.type_name(), "gradual-rollout");

        let rule: PolicyRule =
            serde_json::from_value(json!({"id": "r3", "type": "deployable-versions"})).unwrap();
        assert_eq!(rule.kind, RuleKind::DeployableVersions {});
    }

    #[test]
    fn test_window_wire_format() {
        let rule: PolicyRule = serde_json::from_value(json!({
            "id": "w",
            "type": "deployment-window",
            "windows": [{"days": ["Mon", "Tue"], "start": "09:00:00", "end": "17:00:00"}]
        }))
        .unwrap();
        match rule.kind {
            RuleKind::DeploymentWindow { windows, deny } => {
                assert!(!deny);
                assert_eq!(windows[0].days, vec![Weekday::Mon, Weekday::Tue]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_policy_defaults() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "p1",
            "name": "gate",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(policy.enabled);
        assert!(policy.target_selectors.is_empty());
    }
}
