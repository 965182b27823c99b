//! Shared fixtures for rule tests

use crate::scope::Scope;
use chrono::{DateTime, Duration, TimeZone, Utc};
use keel_store::{MutationContext, Store};
use keel_types::{
    ApprovalStatus, Deployment, DeploymentVersion, Environment, Job, JobStatus, ManualClock,
    Release, ReleaseTarget, Resource, UserApprovalRecord,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Fixture {
    pub store: Arc<Store>,
    pub clock: ManualClock,
    pub t0: DateTime<Utc>,
}

impl Fixture {
    pub fn target(&self) -> ReleaseTarget {
        ReleaseTarget::new("r1", "e1", "d1")
    }

    /// Full scope for `version_id` on r1-e1-d1
    pub fn scope(&self, version_id: &str) -> Scope {
        self.scope_for(version_id, &self.target())
    }

    pub fn scope_for(&self, version_id: &str, target: &ReleaseTarget) -> Scope {
        let store = &self.store;
        let mut scope = Scope::new().with_release_target(Arc::new(target.clone()));
        if let Some(v) = store.deployment_versions.get(version_id) {
            scope = scope.with_version(Arc::new(v));
        }
        if let Some(e) = store.environments.get(&target.environment_id) {
            scope = scope.with_environment(Arc::new(e));
        }
        if let Some(r) = store.resources.get(&target.resource_id) {
            scope = scope.with_resource(Arc::new(r));
        }
        if let Some(d) = store.deployments.get(&target.deployment_id) {
            scope = scope.with_deployment(Arc::new(d));
        }
        scope
    }
}

/// Store with d1/e1 on system s1, resource r1 and target r1-e1-d1;
/// version v1 created at t0
pub fn fixture() -> Fixture {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
    let store = Arc::new(Store::default());
    let ctx = MutationContext::detached();
    store
        .deployments
        .upsert(&ctx, Deployment::new("d1", "api").with_systems(["s1"]))
        .unwrap();
    store
        .environments
        .upsert(&ctx, Environment::new("e1", "prod", t0).with_systems(["s1"]))
        .unwrap();
    store
        .resources
        .upsert(&ctx, Resource::new("r1", "cluster-1", t0))
        .unwrap();
    store.sync_all_targets(&ctx).unwrap();
    add_version(&store, "v1", "d1", t0);
    Fixture {
        store,
        clock: ManualClock::new(t0),
        t0,
    }
}

pub fn add_version(store: &Store, id: &str, deployment_id: &str, created_at: DateTime<Utc>) -> DeploymentVersion {
    let version = DeploymentVersion::new(id, deployment_id, id, created_at);
    store
        .deployment_versions
        .upsert(&MutationContext::detached(), version.clone())
        .unwrap();
    version
}

pub fn approve(store: &Store, version_id: &str, environment_id: &str, user_id: &str, status: ApprovalStatus) {
    store
        .user_approval_records
        .upsert(
            &MutationContext::detached(),
            UserApprovalRecord {
                version_id: version_id.into(),
                environment_id: environment_id.into(),
                user_id: user_id.into(),
                status,
                reason: None,
                created_at: Utc::now(),
            },
        )
        .unwrap();
}

/// Record a job for `version_id` on `target` with the given status
pub fn deploy(
    store: &Store,
    target: &ReleaseTarget,
    version_id: &str,
    status: JobStatus,
    at: DateTime<Utc>,
) -> Job {
    let version = store
        .deployment_versions
        .get(version_id)
        .unwrap_or_else(|| DeploymentVersion::new(version_id, &target.deployment_id, version_id, at));
    let release = Release::new(target.clone(), version, BTreeMap::new(), at);
    let ctx = MutationContext::detached();
    store.releases.upsert(&ctx, release.clone()).unwrap();
    let mut job = Job::pending(format!("job-{}-{}", release.id, at.timestamp()), &release.id, at);
    job.status = status;
    if status.is_terminal() {
        job.completed_at = Some(at + Duration::seconds(1));
    }
    store.jobs.upsert(&ctx, job.clone()).unwrap();
    job
}
