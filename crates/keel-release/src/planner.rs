//! Deployment planner
//!
//! Walks a target's versions newest first and picks the first one every
//! applicable rule admits. Rules asking for an action either let the walk
//! continue to older versions (cooldown, rollout) or stop it and report the
//! version as pending (approvals, windows).

use crate::error::{ReleaseError, Result};
use crate::variables::resolve_variables;
use chrono::{DateTime, Utc};
use keel_policy::{
    evaluate_policy, run_rules, EvaluatorFactory, Memoized, PolicyEvaluation, RuleEvaluation,
    RuleEvaluator, Scope,
};
use keel_store::Store;
use keel_types::{
    Deployment, DeploymentVersion, EntityKind, Environment, Policy, Release, ReleaseTarget,
    Resource, SharedClock,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Entities a release target refers to
#[derive(Debug, Clone)]
pub struct TargetEntities {
    pub resource: Arc<Resource>,
    pub environment: Arc<Environment>,
    pub deployment: Arc<Deployment>,
}

impl TargetEntities {
    /// Load the target's resource, environment and deployment
    pub fn load(store: &Store, target: &ReleaseTarget) -> Result<Self> {
        let resource = store
            .resources
            .get(&target.resource_id)
            .ok_or_else(|| ReleaseError::not_found(EntityKind::Resource, &target.resource_id))?;
        let environment = store.environments.get(&target.environment_id).ok_or_else(|| {
            ReleaseError::not_found(EntityKind::Environment, &target.environment_id)
        })?;
        let deployment = store.deployments.get(&target.deployment_id).ok_or_else(|| {
            ReleaseError::not_found(EntityKind::Deployment, &target.deployment_id)
        })?;
        Ok(Self {
            resource: Arc::new(resource),
            environment: Arc::new(environment),
            deployment: Arc::new(deployment),
        })
    }

    fn scope(&self, version: Arc<DeploymentVersion>, target: Arc<ReleaseTarget>) -> Scope {
        Scope::new()
            .with_version(version)
            .with_environment(self.environment.clone())
            .with_resource(self.resource.clone())
            .with_deployment(self.deployment.clone())
            .with_release_target(target)
    }
}

/// Planner output for one target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredRelease {
    pub release: Release,

    /// False when the release is blocked on an approval or a wait
    pub can_deploy: bool,

    /// Rules still waiting on an action for this release's version
    pub pending_actions: Vec<RuleEvaluation>,

    /// Earliest instant a waiting rule may change its answer
    pub next_evaluation_time: Option<DateTime<Utc>>,
}

impl DesiredRelease {
    pub fn needs_approval(&self) -> bool {
        self.pending_actions
            .iter()
            .any(|r| r.action_type == Some(keel_policy::ActionType::Approval))
    }
}

/// Policy evaluations of one version on one target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEvaluation {
    pub version_id: String,
    pub policies: Vec<PolicyEvaluation>,
}

impl TargetEvaluation {
    /// True when no policy denies or waits; true for a target with no policies
    pub fn can_deploy(&self) -> bool {
        self.policies.iter().all(PolicyEvaluation::can_deploy)
    }

    pub fn needs_approval(&self) -> bool {
        self.policies.iter().any(PolicyEvaluation::needs_approval)
    }

    pub fn pending_actions(&self) -> Vec<&RuleEvaluation> {
        self.policies
            .iter()
            .flat_map(|p| p.rule_results.iter())
            .filter(|r| r.action_required)
            .collect()
    }

    pub fn next_evaluation_time(&self) -> Option<DateTime<Utc>> {
        self.policies
            .iter()
            .filter_map(PolicyEvaluation::next_evaluation_time)
            .min()
    }
}

struct Pending {
    scope: Scope,
    actions: Vec<RuleEvaluation>,
}

/// Chooses the desired release for release targets
#[derive(Debug, Clone)]
pub struct Planner {
    store: Arc<Store>,
    factory: EvaluatorFactory,
    clock: SharedClock,
}

impl Planner {
    pub fn new(store: Arc<Store>, clock: SharedClock) -> Self {
        Self {
            factory: EvaluatorFactory::new(store.clone(), clock.clone()),
            store,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Compute the desired release for `target`
    ///
    /// `None` when no version passes. Any evaluator error fails the call.
    #[instrument(skip(self, entities), fields(target_key = %target.key()))]
    pub async fn plan(
        &self,
        target: &ReleaseTarget,
        entities: Option<&TargetEntities>,
    ) -> Result<Option<DesiredRelease>> {
        let loaded;
        let entities = match entities {
            Some(entities) => entities,
            None => {
                loaded = TargetEntities::load(&self.store, target)?;
                &loaded
            }
        };
        let target_ref = Arc::new(target.clone());

        let global = self.memoized(self.factory.global());
        let policies: Vec<Vec<Arc<dyn RuleEvaluator>>> = self
            .store
            .policies_for_target(target)
            .iter()
            .map(|policy| self.memoized(self.factory.for_policy(policy)))
            .collect();

        let mut candidates = Vec::new();
        for version in self.store.versions_for_deployment(&target.deployment_id) {
            let scope = entities.scope(Arc::new(version), target_ref.clone());
            let run = run_rules(&global, &scope).await?;
            if run.hard_denied() || run.pending() {
                trace!(version_id = %version_id(&scope), "Version filtered by global rules");
                continue;
            }
            candidates.push(scope);
        }
        debug!(candidates = candidates.len(), policies = policies.len(), "Planning");

        let mut first_pending: Option<Pending> = None;
        let mut next_evaluation_time: Option<DateTime<Utc>> = None;

        for scope in candidates {
            let mut actions = Vec::new();
            let mut fallback = true;
            let mut denied = false;

            for evaluators in &policies {
                let run = run_rules(evaluators, &scope).await?;
                if run.hard_denied() {
                    denied = true;
                    break;
                }
                if run.pending() {
                    fallback &= run.fallback_permitted;
                    actions.extend(run.results.into_iter().filter(|r| r.action_required));
                }
            }

            if denied {
                trace!(version_id = %version_id(&scope), "Version denied");
                continue;
            }

            if actions.is_empty() {
                debug!(version_id = %version_id(&scope), "Version admitted");
                let release = self.release_for(&scope, target, entities)?;
                return Ok(Some(DesiredRelease {
                    release,
                    can_deploy: true,
                    pending_actions: Vec::new(),
                    next_evaluation_time,
                }));
            }

            let wake = actions.iter().filter_map(|a| a.next_evaluation_time).min();
            next_evaluation_time = earliest(next_evaluation_time, wake);

            if !fallback {
                debug!(version_id = %version_id(&scope), "Version pending; walk stopped");
                return self
                    .pending_release(Pending { scope, actions }, target, entities, next_evaluation_time)
                    .map(Some);
            }

            trace!(version_id = %version_id(&scope), "Version pending; trying older versions");
            if first_pending.is_none() {
                first_pending = Some(Pending { scope, actions });
            }
        }

        match first_pending {
            Some(pending) => self
                .pending_release(pending, target, entities, next_evaluation_time)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Per-policy evaluations of `version` on `target`
    #[instrument(skip(self, version), fields(target_key = %target.key(), version_id = %version.id))]
    pub async fn evaluate_policies(
        &self,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
    ) -> Result<TargetEvaluation> {
        let entities = TargetEntities::load(&self.store, target)?;
        let scope = entities.scope(Arc::new(version.clone()), Arc::new(target.clone()));

        let mut evaluations = Vec::new();
        for policy in self.store.policies_for_target(target) {
            evaluations.push(self.evaluate_one(&policy, &scope).await?);
        }
        Ok(TargetEvaluation {
            version_id: version.id.clone(),
            policies: evaluations,
        })
    }

    async fn evaluate_one(&self, policy: &Policy, scope: &Scope) -> Result<PolicyEvaluation> {
        let evaluators = self.factory.for_policy(policy);
        Ok(evaluate_policy(&policy.id, &policy.name, &evaluators, scope).await?)
    }

    fn memoized(&self, evaluators: Vec<Arc<dyn RuleEvaluator>>) -> Vec<Arc<dyn RuleEvaluator>> {
        evaluators.into_iter().map(Memoized::wrap).collect()
    }

    fn pending_release(
        &self,
        pending: Pending,
        target: &ReleaseTarget,
        entities: &TargetEntities,
        next_evaluation_time: Option<DateTime<Utc>>,
    ) -> Result<DesiredRelease> {
        let release = self.release_for(&pending.scope, target, entities)?;
        Ok(DesiredRelease {
            release,
            can_deploy: false,
            pending_actions: pending.actions,
            next_evaluation_time,
        })
    }

    fn release_for(
        &self,
        scope: &Scope,
        target: &ReleaseTarget,
        entities: &TargetEntities,
    ) -> Result<Release> {
        let version = scope
            .version
            .as_deref()
            .ok_or_else(|| ReleaseError::not_found(EntityKind::DeploymentVersion, target.key()))?;
        let variables = resolve_variables(&self.store, version, &entities.resource)?;
        Ok(Release::new(
            target.clone(),
            version.clone(),
            variables,
            self.clock.now(),
        ))
    }
}

fn version_id(scope: &Scope) -> &str {
    scope.version.as_ref().map_or("", |v| v.id.as_str())
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_version, approve, deploy, fixture};
    use chrono::Duration;
    use keel_policy::ActionType;
    use keel_store::MutationContext;
    use keel_types::{
        ApprovalStatus, DeploymentVersionStatus, JobStatus, PolicyRule, RuleKind,
    };

    fn add_policy(store: &Store, rules: Vec<PolicyRule>) {
        let mut policy = Policy::new("p1", "gate", Utc::now()).targeting_all();
        for rule in rules {
            policy = policy.with_rule(rule);
        }
        store
            .policies
            .upsert(&MutationContext::detached(), policy)
            .unwrap();
    }

    #[tokio::test]
    async fn test_picks_newest_version_without_policies() {
        let f = fixture();
        add_version(&f.store, "v2", "d1", f.t0 + Duration::minutes(5));

        let desired = f.planner().plan(&f.target(), None).await.unwrap().unwrap();
        assert_eq!(desired.release.version.id, "v2");
        assert!(desired.can_deploy);
        assert!(desired.pending_actions.is_empty());
    }

    #[tokio::test]
    async fn test_no_versions_yields_none() {
        let f = fixture();
        f.store
            .deployment_versions
            .remove(&MutationContext::detached(), "v1");
        assert!(f.planner().plan(&f.target(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_global_rules_filter_unready_versions() {
        let f = fixture();
        let building = DeploymentVersion::new("v2", "d1", "v2", f.t0 + Duration::minutes(5))
            .with_status(DeploymentVersionStatus::Building);
        f.store
            .deployment_versions
            .upsert(&MutationContext::detached(), building)
            .unwrap();

        let desired = f.planner().plan(&f.target(), None).await.unwrap().unwrap();
        assert_eq!(desired.release.version.id, "v1");
    }

    #[tokio::test]
    async fn test_approval_stops_walk_and_reports_pending() {
        let f = fixture();
        deploy(&f.store, &f.target(), "v1", JobStatus::Successful, f.t0);
        add_version(&f.store, "v2", "d1", f.t0 + Duration::minutes(5));
        add_policy(
            &f.store,
            vec![PolicyRule::new("approval", RuleKind::AnyApproval { min_approvals: 2 })],
        );

        let planner = f.planner();
        let desired = planner.plan(&f.target(), None).await.unwrap().unwrap();
        assert_eq!(desired.release.version.id, "v2");
        assert!(!desired.can_deploy);
        assert!(desired.needs_approval());

        approve(&f.store, "v2", "e1", "alice", ApprovalStatus::Approved);
        approve(&f.store, "v2", "e1", "bob", ApprovalStatus::Approved);
        let desired = planner.plan(&f.target(), None).await.unwrap().unwrap();
        assert_eq!(desired.release.version.id, "v2");
        assert!(desired.can_deploy);
    }

    #[tokio::test]
    async fn test_cooldown_falls_back_to_older_version() {
        let f = fixture();
        deploy(&f.store, &f.target(), "v1", JobStatus::Successful, f.t0);
        f.clock.set(f.t0 + Duration::minutes(10));
        add_version(&f.store, "v2", "d1", f.t0 + Duration::minutes(8));
        add_policy(
            &f.store,
            vec![PolicyRule::new(
                "cooldown",
                RuleKind::VersionCooldown {
                    interval_seconds: 3600,
                },
            )],
        );

        let desired = f.planner().plan(&f.target(), None).await.unwrap().unwrap();
        assert_eq!(desired.release.version.id, "v1");
        assert!(desired.can_deploy);
        assert!(desired.next_evaluation_time.is_some());
    }

    #[tokio::test]
    async fn test_evaluate_policies_reports_per_policy() {
        let f = fixture();
        add_policy(
            &f.store,
            vec![PolicyRule::new("approval", RuleKind::AnyApproval { min_approvals: 1 })],
        );
        let version = f.store.deployment_versions.get("v1").unwrap();

        let evaluation = f
            .planner()
            .evaluate_policies(&f.target(), &version)
            .await
            .unwrap();
        assert_eq!(evaluation.policies.len(), 1);
        assert!(!evaluation.can_deploy());
        assert!(evaluation.needs_approval());
        let actions = evaluation.pending_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, Some(ActionType::Approval));
    }

    #[tokio::test]
    async fn test_evaluate_policies_without_policies_allows() {
        let f = fixture();
        let version = f.store.deployment_versions.get("v1").unwrap();
        let evaluation = f
            .planner()
            .evaluate_policies(&f.target(), &version)
            .await
            .unwrap();
        assert!(evaluation.policies.is_empty());
        assert!(evaluation.can_deploy());
    }

    #[tokio::test]
    async fn test_missing_entities_fail() {
        let f = fixture();
        let target = ReleaseTarget::new("missing", "e1", "d1");
        let err = f.planner().plan(&target, None).await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
    }
}
