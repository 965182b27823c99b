//! Version cooldown rule
//!
//! The reference version is the version of the newest processing job for
//! the target, else the currently deployed version. A candidate is admitted
//! once `interval` has elapsed since the reference version was created; any
//! newer candidate then passes, so versions released during the cooldown
//! are batched into one deployment.

use crate::error::Result;
use crate::evaluation::{ActionType, RuleEvaluation};
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use chrono::Duration;
use keel_selector::truncate_to_seconds;
use keel_store::Store;
use keel_types::{DeploymentVersion, ReleaseTarget, SharedClock};
use std::sync::Arc;

const RULE_TYPE: &str = "version-cooldown";

#[derive(Debug)]
pub struct VersionCooldownEvaluator {
    rule_id: String,
    interval_seconds: u64,
    store: Arc<Store>,
    clock: SharedClock,
}

impl VersionCooldownEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        interval_seconds: u64,
        store: Arc<Store>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            interval_seconds,
            store,
            clock,
        }
    }

    fn reference_version(&self, target: &ReleaseTarget) -> Option<DeploymentVersion> {
        let in_flight = self
            .store
            .processing_jobs_for_target(target)
            .into_iter()
            .next()
            .and_then(|job| self.store.releases.get(&job.release_id))
            .map(|release| release.version);
        in_flight.or_else(|| {
            self.store
                .get_current_release(target)
                .map(|(release, _)| release.version)
        })
    }
}

#[async_trait]
impl RuleEvaluator for VersionCooldownEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::RELEASE_TARGET
    }

    fn rule_type(&self) -> &'static str {
        RULE_TYPE
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        4
    }

    fn permits_fallback(&self) -> bool {
        true
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let candidate = scope.require_version(RULE_TYPE)?;
        let target = scope.require_release_target(RULE_TYPE)?;

        if self.interval_seconds == 0 {
            return Ok(RuleEvaluation::allowed("No cooldown configured"));
        }

        let Some(reference) = self.reference_version(target) else {
            return Ok(RuleEvaluation::allowed("First deployment; no cooldown applies"));
        };

        if reference.id == candidate.id {
            return Ok(RuleEvaluation::allowed("Candidate is the reference version")
                .with_detail("referenceVersionId", reference.id));
        }

        let interval = Duration::seconds(self.interval_seconds as i64);
        let next_deployment = truncate_to_seconds(reference.created_at) + interval;
        let now = truncate_to_seconds(self.clock.now());

        if now >= next_deployment {
            return Ok(RuleEvaluation::allowed(format!(
                "Cooldown since version {} has elapsed",
                reference.tag
            ))
            .with_detail("referenceVersionId", reference.id)
            .with_detail("nextDeploymentTime", next_deployment.to_rfc3339()));
        }

        let remaining = next_deployment - now;
        Ok(RuleEvaluation::pending(
            ActionType::Wait,
            format!(
                "Cooldown after version {}: {}s remaining",
                reference.tag,
                remaining.num_seconds()
            ),
        )
        .with_detail("referenceVersionId", reference.id)
        .with_detail("intervalSeconds", self.interval_seconds)
        .with_detail("nextDeploymentTime", next_deployment.to_rfc3339())
        .with_next_evaluation_time(next_deployment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{add_version, deploy, fixture};
    use keel_types::JobStatus;

    #[tokio::test]
    async fn test_first_deployment_allowed() {
        let fx = fixture();
        let evaluator =
            VersionCooldownEvaluator::new("c", 3600, fx.store.clone(), Arc::new(fx.clock.clone()));
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_interval_always_allows() {
        let fx = fixture();
        deploy(&fx.store, &fx.target(), "v1", JobStatus::Successful, fx.t0);
        add_version(&fx.store, "v2", "d1", fx.t0 + Duration::seconds(1));
        let evaluator =
            VersionCooldownEvaluator::new("c", 0, fx.store.clone(), Arc::new(fx.clock.clone()));
        assert!(evaluator.evaluate(&fx.scope("v2")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_waits_until_interval_elapses() {
        let fx = fixture();
        deploy(&fx.store, &fx.target(), "v1", JobStatus::Successful, fx.t0);
        add_version(&fx.store, "v2", "d1", fx.t0 + Duration::minutes(10));
        fx.clock.set(fx.t0 + Duration::minutes(30));

        let evaluator =
            VersionCooldownEvaluator::new("c", 3600, fx.store.clone(), Arc::new(fx.clock.clone()));
        let result = evaluator.evaluate(&fx.scope("v2")).await.unwrap();
        assert!(result.action_required);
        assert_eq!(result.action_type, Some(ActionType::Wait));
        assert_eq!(result.next_evaluation_time, Some(fx.t0 + Duration::hours(1)));

        fx.clock.set(fx.t0 + Duration::hours(1));
        assert!(evaluator.evaluate(&fx.scope("v2")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_redeploying_reference_version_allowed() {
        let fx = fixture();
        deploy(&fx.store, &fx.target(), "v1", JobStatus::Successful, fx.t0);
        let evaluator =
            VersionCooldownEvaluator::new("c", 3600, fx.store.clone(), Arc::new(fx.clock.clone()));
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_in_flight_job_is_reference() {
        let fx = fixture();
        deploy(&fx.store, &fx.target(), "v1", JobStatus::Successful, fx.t0);
        add_version(&fx.store, "v2", "d1", fx.t0 + Duration::hours(2));
        deploy(&fx.store, &fx.target(), "v2", JobStatus::InProgress, fx.t0 + Duration::hours(2));
        add_version(&fx.store, "v3", "d1", fx.t0 + Duration::hours(2) + Duration::minutes(5));
        fx.clock.set(fx.t0 + Duration::hours(2) + Duration::minutes(10));

        let evaluator =
            VersionCooldownEvaluator::new("c", 3600, fx.store.clone(), Arc::new(fx.clock.clone()));
        let result = evaluator.evaluate(&fx.scope("v3")).await.unwrap();
        assert!(result.action_required);
        assert_eq!(
            result.details["referenceVersionId"],
            serde_json::json!("v2")
        );
    }
}
