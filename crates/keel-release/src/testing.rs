//! Shared fixtures for release tests

use crate::eligibility::EligibilityChecker;
use crate::error::{ReleaseError, Result};
use crate::executor::{Dispatcher, Executor};
use crate::manager::ReleaseManager;
use crate::orchestrator::Orchestrator;
use crate::planner::Planner;
use crate::state::StateIndex;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use keel_store::{MutationContext, Store};
use keel_types::{
    ApprovalStatus, Deployment, DeploymentVersion, Environment, Job, JobAgent, JobAgentConfig,
    JobStatus, ManualClock, Release, ReleaseTarget, Resource, UserApprovalRecord,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Dispatcher recording job ids, optionally failing every dispatch
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    jobs: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl RecordingDispatcher {
    pub fn failing(message: &str) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            failure: Some(message.to_string()),
        }
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: &Job, _config: &JobAgentConfig) -> Result<()> {
        if let Some(message) = &self.failure {
            return Err(ReleaseError::Dispatch(message.clone()));
        }
        self.jobs.lock().push(job.id.clone());
        Ok(())
    }
}

pub struct Fixture {
    pub store: Arc<Store>,
    pub clock: ManualClock,
    pub t0: DateTime<Utc>,
}

impl Fixture {
    pub fn target(&self) -> ReleaseTarget {
        ReleaseTarget::new("r1", "e1", "d1")
    }

    pub fn planner(&self) -> Planner {
        Planner::new(self.store.clone(), Arc::new(self.clock.clone()))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let clock = Arc::new(self.clock.clone());
        Orchestrator::new(
            self.planner(),
            EligibilityChecker::new(self.store.clone()),
            Executor::new(
                self.store.clone(),
                Arc::new(RecordingDispatcher::default()),
                clock,
            ),
        )
    }

    pub fn manager(&self) -> ReleaseManager {
        ReleaseManager::new(
            self.store.clone(),
            Arc::new(StateIndex::new(self.planner())),
            self.orchestrator(),
            Arc::new(self.clock.clone()),
        )
    }
}

/// Store with d1/e1 on system s1, resource r1, target r1-e1-d1 and a
/// test-runner agent; version v1 created at t0
pub fn fixture() -> Fixture {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
    let store = Arc::new(Store::default());
    let ctx = MutationContext::detached();
    store
        .job_agents
        .upsert(
            &ctx,
            JobAgent {
                id: "agent-1".into(),
                workspace_id: String::new(),
                name: "runner".into(),
                agent_type: "test-runner".into(),
                config: serde_json::Map::new(),
            },
        )
        .unwrap();
    store
        .deployments
        .upsert(
            &ctx,
            Deployment::new("d1", "api")
                .with_systems(["s1"])
                .with_job_agent("agent-1"),
        )
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
