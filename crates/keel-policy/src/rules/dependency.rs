//! Deployment dependency rule

use crate::error::Result;
use crate::evaluation::RuleEvaluation;
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use keel_selector::Selector;
use keel_store::Store;
use std::sync::Arc;

const RULE_TYPE: &str = "deployment-dependency";

/// Every other deployment matched by the selector must have a current
/// release on the same resource, optionally matching a version selector
#[derive(Debug)]
pub struct DeploymentDependencyEvaluator {
    rule_id: String,
    depends_on: Selector,
    version_selector: Option<Selector>,
    store: Arc<Store>,
}

impl DeploymentDependencyEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        depends_on: Selector,
        version_selector: Option<Selector>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            depends_on,
            version_selector,
            store,
        }
    }

    /// Whether `deployment_id` currently runs a satisfying version on the resource
    fn satisfied(&self, deployment_id: &str, resource_id: &str) -> Result<bool> {
        for target in self.store.targets_for_resource(resource_id) {
            if target.deployment_id != deployment_id {
                continue;
            }
            let Some((release, _)) = self.store.get_current_release(&target) else {
                continue;
            };
            let matched = self
                .store
                .selectors()
                .matches_optional(self.version_selector.as_ref(), &release.version)?;
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl RuleEvaluator for DeploymentDependencyEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RESOURCE | ScopeFields::DEPLOYMENT
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
        let resource = scope.require_resource(RULE_TYPE)?;
        let deployment = scope.require_deployment(RULE_TYPE)?;

        let mut dependencies = Vec::new();
        for candidate in self.store.deployments.values() {
            if candidate.id == deployment.id {
                continue;
            }
            if self.store.selectors().matches(&self.depends_on, &candidate)? {
                dependencies.push(candidate);
            }
        }
        dependencies.sort_by(|a, b| a.id.cmp(&b.id));

        if dependencies.is_empty() {
            return Ok(RuleEvaluation::denied(
                "No deployments match the dependency selector",
            ));
        }

        let mut unsatisfied = Vec::new();
        for dependency in &dependencies {
            if !self.satisfied(&dependency.id, &resource.id)? {
                unsatisfied.push(dependency.name.clone());
            }
        }

        if unsatisfied.is_empty() {
            return Ok(RuleEvaluation::allowed(format!(
                "All {} dependencies are deployed on {}",
                dependencies.len(),
                resource.name
            )));
        }

        Ok(RuleEvaluation::denied(format!(
            "Dependencies not deployed on {}: {}",
            resource.name,
            unsatisfied.join(", ")
        ))
        .with_detail("unsatisfied", unsatisfied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{add_version, deploy, fixture};
    use keel_store::MutationContext;
    use keel_types::{Deployment, JobStatus, ReleaseTarget};
    use serde_json::json;

    #[tokio::test]
    async fn test_requires_dependency_current_release() {
        let fx = fixture();
        let ctx = MutationContext::detached();
        fx.store
            .deployments
            .upsert(&ctx, Deployment::new("db", "database").with_systems(["s1"]))
            .unwrap();
        fx.store.sync_all_targets(&ctx).unwrap();
        add_version(&fx.store, "db-1", "db", fx.t0);

        let evaluator = DeploymentDependencyEvaluator::new(
            "dep",
            Selector::Json(json!({"type": "name", "operator": "equals", "value": "database"})),
            Some(Selector::Json(
                json!({"type": "version", "operator": "equals", "value": "db-1"}),
            )),
            fx.store.clone(),
        );

        let result = evaluator.evaluate(&fx.scope("v1")).await.unwrap();
        assert!(result.is_hard_deny());

        deploy(
            &fx.store,
            &ReleaseTarget::new("r1", "e1", "db"),
            "db-1",
            JobStatus::Successful,
            fx.t0,
        );
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().allowed);
    }
}
