//! Rule evaluators and the factory mapping policy rules onto them

pub mod approval;
pub mod cooldown;
pub mod dependency;
pub mod deployable;
pub mod progression;
pub mod rollout;
pub mod version_selector;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use approval::AnyApprovalEvaluator;
pub use cooldown::VersionCooldownEvaluator;
pub use dependency::DeploymentDependencyEvaluator;
pub use deployable::{DeployableVersionsEvaluator, PausedVersionsEvaluator};
pub use progression::EnvironmentProgressionEvaluator;
pub use rollout::GradualRolloutEvaluator;
pub use version_selector::VersionSelectorEvaluator;
pub use window::DeploymentWindowEvaluator;

use crate::error::{PolicyError, Result};
use crate::evaluator::{sort_by_complexity, RuleEvaluator};
use keel_store::Store;
use keel_types::{Policy, PolicyRule, RolloutSchedule, RuleKind, SharedClock};
use std::sync::Arc;

/// Rule id used by the evaluators applied to every target
pub const GLOBAL_RULE_ID: &str = "global";

/// Default cap on consecutive failures when no retry rule applies
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Builds evaluators bound to a store and clock
#[derive(Debug, Clone)]
pub struct EvaluatorFactory {
    store: Arc<Store>,
    clock: SharedClock,
}

impl EvaluatorFactory {
    pub fn new(store: Arc<Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Evaluator for a single rule
    ///
    /// Retry rules shape job eligibility rather than version selection and
    /// have no evaluator.
    pub fn for_rule(&self, rule: &PolicyRule) -> Option<Arc<dyn RuleEvaluator>> {
        let store = self.store.clone();
        let id = rule.id.clone();
        let evaluator: Arc<dyn RuleEvaluator> = match &rule.kind {
            RuleKind::AnyApproval { min_approvals } => {
                Arc::new(AnyApprovalEvaluator::new(id, *min_approvals, store))
            }
            RuleKind::EnvironmentProgression {
                depends_on_environment_selector,
            } => Arc::new(EnvironmentProgressionEvaluator::new(
                id,
                depends_on_environment_selector.clone(),
                store,
            )),
            RuleKind::GradualRollout {
                rollout_duration_seconds,
                schedule,
            } => Arc::new(GradualRolloutEvaluator::new(
                id,
                *rollout_duration_seconds,
                *schedule,
                store,
                self.clock.clone(),
            )),
            RuleKind::VersionSelector {
                selector,
                description,
            } => Arc::new(VersionSelectorEvaluator::new(
                id,
                selector.clone(),
                description.clone(),
                store,
            )),
            RuleKind::DeploymentDependency {
                depends_on_deployment_selector,
                version_selector,
            } => Arc::new(DeploymentDependencyEvaluator::new(
                id,
                depends_on_deployment_selector.clone(),
                version_selector.clone(),
                store,
            )),
            RuleKind::DeploymentWindow { windows, deny } => Arc::new(
                DeploymentWindowEvaluator::new(id, windows.clone(), *deny, self.clock.clone()),
            ),
            RuleKind::VersionCooldown { interval_seconds } => Arc::new(
                VersionCooldownEvaluator::new(id, *interval_seconds, store, self.clock.clone()),
            ),
            RuleKind::DeployableVersions {} => Arc::new(DeployableVersionsEvaluator::new(id)),
            RuleKind::Retry { .. } => return None,
        };
        Some(evaluator)
    }

    /// Evaluators for every rule of `policy`, cheapest first
    pub fn for_policy(&self, policy: &Policy) -> Vec<Arc<dyn RuleEvaluator>> {
        let mut evaluators: Vec<_> = policy
            .rules
            .iter()
            .filter_map(|rule| self.for_rule(rule))
            .collect();
        sort_by_complexity(&mut evaluators);
        evaluators
    }

    /// Evaluators applied to every target regardless of policies
    pub fn global(&self) -> Vec<Arc<dyn RuleEvaluator>> {
        vec![
            Arc::new(DeployableVersionsEvaluator::new(GLOBAL_RULE_ID)),
            Arc::new(PausedVersionsEvaluator::new(GLOBAL_RULE_ID, self.store.clone())),
        ]
    }

    /// Reject rule configurations no evaluator can run
    pub fn validate(&self, policy: &Policy) -> Result<()> {
        let selectors = self.store.selectors();
        for rule in &policy.rules {
            let invalid = |reason: &str| PolicyError::InvalidRule {
                rule_type: rule.kind.type_name(),
                rule_id: rule.id.clone(),
                reason: reason.to_string(),
            };
            match &rule.kind {
                RuleKind::AnyApproval { min_approvals: 0 } => {
                    return Err(invalid("minApprovals must be at least 1"));
                }
                RuleKind::GradualRollout {
                    schedule: RolloutSchedule::Step { steps: 0 },
                    ..
                } => return Err(invalid("step schedule needs at least one step")),
                RuleKind::DeploymentWindow { windows, .. } if windows.is_empty() => {
                    return Err(invalid("at least one window is required"));
                }
                RuleKind::DeploymentWindow { windows, .. }
                    if windows.iter().any(|w| w.days.is_empty()) =>
                {
                    return Err(invalid("every window needs at least one day"));
                }
                RuleKind::EnvironmentProgression {
                    depends_on_environment_selector: selector,
                }
                | RuleKind::VersionSelector { selector, .. } => selectors.validate(selector)?,
                RuleKind::DeploymentDependency {
                    depends_on_deployment_selector,
                    version_selector,
                } => {
                    selectors.validate(depends_on_deployment_selector)?;
                    if let Some(selector) = version_selector {
                        selectors.validate(selector)?;
                    }
                }
                _ => {}
            }
        }
        for target in &policy.target_selectors {
            for selector in [
                &target.deployment_selector,
                &target.environment_selector,
                &target.resource_selector,
            ]
            .into_iter()
            .flatten()
            {
                selectors.validate(selector)?;
            }
        }
        Ok(())
    }
}

/// Smallest retry cap across `policies`, or `default` when none set one
pub fn max_retries(policies: &[Policy], default: u32) -> u32 {
    policies
        .iter()
        .flat_map(|p| p.rules.iter())
        .filter_map(|rule| match rule.kind {
            RuleKind::Retry { max_retries } => Some(max_retries),
            _ => None,
        })
        .min()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_selector::Selector;
    use keel_types::{ManualClock, TimeWindow};
    use serde_json::json;

    fn factory() -> EvaluatorFactory {
        EvaluatorFactory::new(Arc::new(Store::default()), Arc::new(ManualClock::new(Utc::now())))
    }

    #[test]
    fn test_policy_evaluators_sorted_and_retry_skipped() {
        let policy = Policy::new("p1", "gates", Utc::now())
            .with_rule(PolicyRule::new("a", RuleKind::VersionCooldown { interval_seconds: 60 }))
            .with_rule(PolicyRule::new("b", RuleKind::Retry { max_retries: 1 }))
            .with_rule(PolicyRule::new(
                "c",
                RuleKind::VersionSelector {
                    selector: Selector::match_all(),
                    description: None,
                },
            ));
        let evaluators = factory().for_policy(&policy);
        let types: Vec<&str> = evaluators.iter().map(|e| e.rule_type()).collect();
        assert_eq!(types, vec!["version-selector", "version-cooldown"]);
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        let f = factory();
        let zero = Policy::new("p", "p", Utc::now())
            .with_rule(PolicyRule::new("a", RuleKind::AnyApproval { min_approvals: 0 }));
        assert!(matches!(f.validate(&zero), Err(PolicyError::InvalidRule { .. })));

        let no_windows = Policy::new("p", "p", Utc::now()).with_rule(PolicyRule::new(
            "w",
            RuleKind::DeploymentWindow {
                windows: Vec::<TimeWindow>::new(),
                deny: false,
            },
        ));
        assert!(f.validate(&no_windows).is_err());

        let no_days = Policy::new("p", "p", Utc::now()).with_rule(PolicyRule::new(
            "w",
            RuleKind::DeploymentWindow {
                windows: vec![TimeWindow {
                    days: Vec::new(),
                    start: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end: chrono::NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                }],
                deny: false,
            },
        ));
        assert!(matches!(f.validate(&no_days), Err(PolicyError::InvalidRule { .. })));

        let bad_selector = Policy::new("p", "p", Utc::now()).with_rule(PolicyRule::new(
            "v",
            RuleKind::VersionSelector {
                selector: Selector::Json(json!({"type": "nope"})),
                description: None,
            },
        ));
        assert!(matches!(f.validate(&bad_selector), Err(PolicyError::Selector(_))));
    }

    #[test]
    fn test_max_retries_takes_smallest() {
        assert_eq!(max_retries(&[], DEFAULT_MAX_RETRIES), DEFAULT_MAX_RETRIES);
        let a = Policy::new("a", "a", Utc::now())
            .with_rule(PolicyRule::new("r", RuleKind::Retry { max_retries: 5 }));
        let b = Policy::new("b", "b", Utc::now())
            .with_rule(PolicyRule::new("r", RuleKind::Retry { max_retries: 2 }));
        assert_eq!(max_retries(&[a, b], DEFAULT_MAX_RETRIES), 2);
    }
}
