//! Environment progression rule

use crate::error::Result;
use crate::evaluation::RuleEvaluation;
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use keel_selector::Selector;
use keel_store::Store;
use keel_types::ReleaseTarget;
use std::sync::Arc;

const RULE_TYPE: &str = "environment-progression";

/// Version must have succeeded on this resource in every environment
/// matched by the dependency selector that also deploys the resource
#[derive(Debug)]
pub struct EnvironmentProgressionEvaluator {
    rule_id: String,
    depends_on: Selector,
    store: Arc<Store>,
}

impl EnvironmentProgressionEvaluator {
    pub fn new(rule_id: impl Into<String>, depends_on: Selector, store: Arc<Store>) -> Self {
        Self {
            rule_id: rule_id.into(),
            depends_on,
            store,
        }
    }

    fn succeeded_on(&self, target: &ReleaseTarget, version_id: &str) -> bool {
        self.store.jobs_for_target(target).iter().any(|job| {
            job.status.is_successful()
                && self
                    .store
                    .releases
                    .get(&job.release_id)
                    .is_some_and(|r| r.version.id == version_id)
        })
    }
}

#[async_trait]
impl RuleEvaluator for EnvironmentProgressionEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::ENVIRONMENT | ScopeFields::RESOURCE | ScopeFields::DEPLOYMENT
    }

    fn rule_type(&self) -> &'static str {
        RULE_TYPE
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        6
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let version = scope.require_version(RULE_TYPE)?;
        let environment = scope.require_environment(RULE_TYPE)?;
        let resource = scope.require_resource(RULE_TYPE)?;
        let deployment = scope.require_deployment(RULE_TYPE)?;

        let mut dependencies = Vec::new();
        for candidate in self.store.environments.values() {
            if candidate.id == environment.id {
                continue;
            }
            if self.store.selectors().matches(&self.depends_on, &candidate)? {
                dependencies.push(candidate);
            }
        }
        dependencies.sort_by(|a, b| a.id.cmp(&b.id));

        if dependencies.is_empty() {
            return Ok(RuleEvaluation::denied(
                "No environments match the progression dependency selector",
            ));
        }

        // Only environments that actually deploy this resource gate it
        let gating: Vec<(ReleaseTarget, &str)> = dependencies
            .iter()
            .map(|env| {
                (
                    ReleaseTarget::new(&resource.id, &env.id, &deployment.id),
                    env.name.as_str(),
                )
            })
            .filter(|(target, _)| self.store.release_targets.contains(&target.key()))
            .collect();

        if gating.is_empty() {
            return Ok(RuleEvaluation::allowed(
                "No dependency environment deploys this resource",
            ));
        }

        let missing: Vec<String> = gating
            .iter()
            .filter(|(target, _)| !self.succeeded_on(target, &version.id))
            .map(|(_, name)| name.to_string())
            .collect();

        if missing.is_empty() {
            let names: Vec<String> = gating.iter().map(|(_, name)| name.to_string()).collect();
            return Ok(RuleEvaluation::allowed(format!(
                "Version {} succeeded in all dependency environments",
                version.tag
            ))
            .with_detail("environments", names));
        }

        Ok(RuleEvaluation::denied(format!(
            "Version {} has not succeeded in: {}",
            version.tag,
            missing.join(", ")
        ))
        .with_detail("pendingEnvironments", missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{deploy, fixture};
    use chrono::Utc;
    use keel_store::MutationContext;
    use keel_types::{Environment, JobStatus};
    use serde_json::json;

    fn staging_selector() -> Selector {
        Selector::Json(json!({"type": "name", "operator": "equals", "value": "staging"}))
    }

    #[tokio::test]
    async fn test_requires_success_in_dependency() {
        let fx = fixture();
        let ctx = MutationContext::detached();
        fx.store
            .environments
            .upsert(
                &ctx,
                Environment::new("e0", "staging", Utc::now()).with_systems(["s1"]),
            )
            .unwrap();
        fx.store.sync_all_targets(&ctx).unwrap();
        let evaluator =
            EnvironmentProgressionEvaluator::new("p", staging_selector(), fx.store.clone());

        let result = evaluator.evaluate(&fx.scope("v1")).await.unwrap();
        assert!(result.is_hard_deny());

        let staging = ReleaseTarget::new("r1", "e0", "d1");
        deploy(&fx.store, &staging, "v1", JobStatus::Failure, fx.t0);
        assert!(!evaluator.evaluate(&fx.scope("v1")).await.unwrap().allowed);

        deploy(&fx.store, &staging, "v1", JobStatus::Successful, fx.t0 + chrono::Duration::seconds(5));
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_no_matching_environment_denies() {
        let fx = fixture();
        let evaluator =
            EnvironmentProgressionEvaluator::new("p", staging_selector(), fx.store.clone());
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().is_hard_deny());
    }

    #[tokio::test]
    async fn test_dependency_without_the_resource_does_not_gate() {
        let fx = fixture();
        let ctx = MutationContext::detached();
        fx.store
            .environments
            .upsert(
                &ctx,
                Environment::new("e0", "staging", Utc::now())
                    .with_systems(["s1"])
                    .with_selector(Selector::Json(json!({
                        "type": "identifier",
                        "operator": "equals",
                        "value": "some-other-cluster"
                    }))),
            )
            .unwrap();
        fx.store.sync_all_targets(&ctx).unwrap();
        assert!(!fx
            .store
            .release_targets
            .contains(&ReleaseTarget::new("r1", "e0", "d1").key()));

        let evaluator =
            EnvironmentProgressionEvaluator::new("p", staging_selector(), fx.store.clone());
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().allowed);
    }
}
