//! Event-driven scenarios through a whole workspace

use chrono::{DateTime, Duration, TimeZone, Utc};
use keel_engine::{Envelope, EngineError, JobStatusUpdate, KindRouter, SetResources, Workspace};
use keel_queue::{ClaimParams, MemoryQueue, ProcessOutcome, Processor, ReconcileQueue, Worker, WorkerConfig};
use keel_selector::Selector;
use keel_store::MutationContext;
use keel_types::{
    ApprovalStatus, CancelToken, Clock, Deployment, DeploymentVersion, Environment, Job, JobAgent,
    JobStatus, JobVerification, ManualClock, Policy, PolicyRule, ReleaseTarget, Resource,
    ResourceProvider, RuleKind, UserApprovalRecord, VerificationStatus,
};
use keel_release::ProcessReport;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Harness {
    clock: ManualClock,
    queue: Arc<MemoryQueue>,
    workspace: Arc<Workspace>,
    worker: Worker<MemoryQueue, KindRouter>,
    cancel: CancelToken,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
}

impl Harness {
    fn new(now: DateTime<Utc>) -> Self {
        let clock = ManualClock::new(now);
        let queue = Arc::new(MemoryQueue::new(Arc::new(clock.clone())));
        let shared: Arc<dyn ReconcileQueue> = queue.clone();
        let workspace = Workspace::builder("ws", shared)
            .with_clock(Arc::new(clock.clone()))
            .build();
        let worker = Worker::new(
            queue.clone(),
            Arc::new(workspace.processor()),
            WorkerConfig {
                worker_id: "w1".into(),
                ..Default::default()
            },
        );
        Self {
            clock,
            queue,
            workspace,
            worker,
            cancel: CancelToken::never(),
        }
    }

    async fn try_send<T: Serialize>(&self, event_type: &str, data: &T) -> Result<ProcessReport, EngineError> {
        let envelope = Envelope::new("ws", event_type.parse().unwrap(), self.clock.now(), data).unwrap();
        self.workspace.apply(&envelope, &self.cancel).await
    }

    async fn send<T: Serialize>(&self, event_type: &str, data: &T) -> ProcessReport {
        self.try_send(event_type, data).await.unwrap()
    }

    /// Run the worker until the queue has nothing claimable
    async fn drain(&self) {
        for _ in 0..20 {
            if self.worker.run_once().await.unwrap() == 0 {
                return;
            }
        }
        panic!("reconcile queue did not settle");
    }

    /// Agent, resource r1, environment e1 and deployment d1 on system s1
    async fn seed(&self) {
        self.send(
            "job-agent.created",
            &JobAgent {
                id: "agent-1".into(),
                workspace_id: "ws".into(),
                name: "runner".into(),
                agent_type: "test-runner".into(),
                config: serde_json::Map::new(),
            },
        )
        .await;
        self.send(
            "resource.created",
            &Resource::new("r1", "cluster-1", t0()).with_metadata("env", "prod"),
        )
        .await;
        self.send(
            "environment.created",
            &Environment::new("e1", "prod", t0()).with_systems(["s1"]),
        )
        .await;
        self.send(
            "deployment.created",
            &Deployment::new("d1", "api")
                .with_systems(["s1"])
                .with_job_agent("agent-1"),
        )
        .await;
    }

    async fn version(&self, id: &str, created_at: DateTime<Utc>) -> ProcessReport {
        self.send(
            "deployment-version.created",
            &DeploymentVersion::new(id, "d1", id, created_at),
        )
        .await
    }

    fn jobs(&self) -> Vec<Job> {
        self.workspace.store().jobs.values()
    }

    fn version_of(&self, job: &Job) -> String {
        self.workspace
            .store()
            .releases
            .get(&job.release_id)
            .unwrap()
            .version
            .id
    }
}

fn target() -> ReleaseTarget {
    ReleaseTarget::new("r1", "e1", "d1")
}

#[tokio::test]
async fn first_deployment_creates_one_pending_job() {
    let h = Harness::new(t0());
    h.seed().await;
    h.version("v1", t0()).await;
    h.drain().await;

    assert!(h.workspace.store().release_targets.contains(&target().key()));
    let state = h.workspace.state(&target(), &h.cancel).await.unwrap();
    let desired = state.desired.unwrap();
    assert_eq!(desired.release.version.id, "v1");
    assert!(desired.can_deploy);

    let jobs = h.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(h.version_of(&jobs[0]), "v1");
}

#[tokio::test]
async fn approval_gate_holds_until_enough_approvals() {
    let h = Harness::new(t0() + Duration::hours(1));
    h.send(
        "policy.created",
        &Policy::new("approvals", "two approvals", t0())
            .targeting_all()
            .with_rule(PolicyRule::new("approval", RuleKind::AnyApproval { min_approvals: 2 })),
    )
    .await;
    h.seed().await;
    h.version("v1", t0()).await;
    h.version("v2", t0() + Duration::minutes(1)).await;
    h.drain().await;

    let desired = h
        .workspace
        .state(&target(), &h.cancel)
        .await
        .unwrap()
        .desired
        .unwrap();
    assert_eq!(desired.release.version.id, "v2");
    assert!(!desired.can_deploy);
    assert!(desired.needs_approval());
    assert_eq!(desired.pending_actions.len(), 1);
    assert!(h.jobs().is_empty());

    let evaluation = h
        .workspace
        .evaluate_policies(&target(), &h.cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(!evaluation.can_deploy());

    let mut created = Vec::new();
    for user in ["alice", "bob"] {
        let report = h
            .send(
                "user-approval.recorded",
                &UserApprovalRecord {
                    version_id: "v2".into(),
                    environment_id: "e1".into(),
                    user_id: user.into(),
                    status: ApprovalStatus::Approved,
                    reason: None,
                    created_at: h.clock.now(),
                },
            )
            .await;
        created.extend(report.jobs_created);
    }
    h.drain().await;

    assert_eq!(created.len(), 1);
    assert_eq!(h.version_of(&created[0]), "v2");
    assert_eq!(h.jobs().len(), 1);
}

#[tokio::test]
async fn cooldown_batches_versions_released_together() {
    let h = Harness::new(t0() + Duration::seconds(7200));
    h.send(
        "policy.created",
        &Policy::new("cooldown", "hourly", t0())
            .targeting_all()
            .with_rule(PolicyRule::new(
                "cooldown",
                RuleKind::VersionCooldown { interval_seconds: 3600 },
            )),
    )
    .await;
    h.seed().await;
    h.version("v0", t0()).await;
    h.drain().await;

    let first = h.jobs().remove(0);
    assert_eq!(h.version_of(&first), "v0");
    h.send(
        "job.status-updated",
        &JobStatusUpdate {
            id: first.id.clone(),
            status: JobStatus::Successful,
            message: None,
            external_id: None,
        },
    )
    .await;

    let ctx = MutationContext::new();
    for (id, minutes) in [("v1", 20), ("v2", 40), ("v3", 70)] {
        h.workspace
            .store()
            .deployment_versions
            .upsert(&ctx, DeploymentVersion::new(id, "d1", id, t0() + Duration::minutes(minutes)))
            .unwrap();
    }
    let report = h
        .workspace
        .manager()
        .process_changes(&MutationContext::detached(), ctx.changes().unwrap(), &h.cancel)
        .await
        .unwrap();

    assert_eq!(report.jobs_created.len(), 1);
    assert_eq!(h.version_of(&report.jobs_created[0]), "v3");
}

#[tokio::test]
async fn verification_refreshes_job_state_only() {
    let h = Harness::new(t0());
    h.seed().await;
    h.version("v1", t0()).await;
    h.drain().await;
    let job = h.jobs().remove(0);
    let before = h.workspace.state(&target(), &h.cancel).await.unwrap();

    h.send(
        "job-verification.recorded",
        &JobVerification {
            id: "check-1".into(),
            job_id: job.id.clone(),
            status: VerificationStatus::Running,
            message: String::new(),
            created_at: t0(),
        },
    )
    .await;

    let index = h.workspace.manager().state();
    assert!(!index.is_dirty(&target().key()));
    let after = index.peek(&target().key());
    assert_eq!(after.desired, before.desired);
    assert_eq!(after.latest_job.unwrap().verifications.len(), 1);

    h.drain().await;
    assert_eq!(h.jobs().len(), 1);
}

#[tokio::test]
async fn selector_change_during_lease_is_handled_after_ack() {
    let h = Harness::new(t0());
    h.send(
        "job-agent.created",
        &JobAgent {
            id: "agent-1".into(),
            workspace_id: "ws".into(),
            name: "runner".into(),
            agent_type: "test-runner".into(),
            config: serde_json::Map::new(),
        },
    )
    .await;
    h.send("resource.created", &Resource::new("r1", "cluster-1", t0()))
        .await;
    h.send(
        "environment.created",
        &Environment::new("e1", "prod", t0()).with_systems(["s1"]),
    )
    .await;
    h.drain().await;

    h.send(
        "deployment.created",
        &Deployment::new("d1", "api").with_systems(["s1"]),
    )
    .await;
    let lease = std::time::Duration::from_secs(30);
    let held = h.queue.claim(ClaimParams::new("w1", 10, lease)).await.unwrap();
    assert_eq!(held.len(), 1);
    let item = held[0].clone();

    h.send(
        "deployment.updated",
        &Deployment::new("d1", "api")
            .with_systems(["s1"])
            .with_selector(Selector::Json(json!({
                "type": "identifier", "operator": "equals", "value": "cluster-1"
            }))),
    )
    .await;
    assert!(h.queue.claim(ClaimParams::new("w2", 10, lease)).await.unwrap().is_empty());

    let outcome = h
        .workspace
        .processor()
        .process(&h.cancel, &item)
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Done);
    let ack = h.queue.ack_success(item.id, "w1", item.updated_at).await.unwrap();
    assert!(!ack.deleted);

    let next = h.queue.claim(ClaimParams::new("w2", 10, lease)).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].scope, item.scope);
    assert_eq!(next[0].payloads.len(), 1);
}

#[tokio::test]
async fn deleting_resource_cancels_pending_job() {
    let h = Harness::new(t0());
    h.seed().await;
    h.version("v1", t0()).await;
    h.drain().await;
    let job = h.jobs().remove(0);

    let report = h.send("resource.deleted", &json!({ "id": "r1" })).await;

    assert_eq!(report.jobs_cancelled, vec![job.id.clone()]);
    assert!(report.jobs_created.is_empty());
    assert_eq!(
        h.workspace.store().jobs.get(&job.id).unwrap().status,
        JobStatus::Cancelled
    );
    assert!(!h.workspace.store().release_targets.contains(&target().key()));
    assert!(!h.workspace.manager().state().contains(&target().key()));
}

#[tokio::test]
async fn provider_batch_replaces_owned_resources() {
    let h = Harness::new(t0());
    h.seed().await;
    h.version("v1", t0()).await;
    h.drain().await;
    h.send(
        "resource-provider.created",
        &ResourceProvider {
            id: "aws".into(),
            workspace_id: "ws".into(),
            name: "aws".into(),
            metadata: BTreeMap::new(),
            created_at: t0(),
        },
    )
    .await;

    let batch = h.workspace.publish_batch(vec![
        Resource::new("", "cluster-2", t0()),
        Resource::new("", "cluster-3", t0()),
    ]);
    let report = h
        .send(
            "resource-provider.set-resources",
            &SetResources {
                provider_id: "aws".into(),
                batch_id: batch.clone(),
            },
        )
        .await;
    assert_eq!(report.jobs_created.len(), 2);

    let owned = h.workspace.store().resources_for_provider("aws");
    assert_eq!(owned.len(), 2);
    assert!(h.workspace.store().resources.contains("r1"));

    let err = h
        .try_send(
            "resource-provider.set-resources",
            &SetResources {
                provider_id: "aws".into(),
                batch_id: batch,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    let shrink = h
        .workspace
        .publish_batch(vec![Resource::new("", "cluster-2", t0())]);
    let report = h
        .send(
            "resource-provider.set-resources",
            &SetResources {
                provider_id: "aws".into(),
                batch_id: shrink,
            },
        )
        .await;
    assert_eq!(report.jobs_cancelled.len(), 1);
    assert!(report.jobs_created.is_empty());
    let owned = h.workspace.store().resources_for_provider("aws");
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].identifier, "cluster-2");
}

#[tokio::test]
async fn redeploy_creates_a_fresh_job() {
    let h = Harness::new(t0());
    h.seed().await;
    h.version("v1", t0()).await;
    h.drain().await;
    let first = h.jobs().remove(0);
    h.send(
        "job.status-updated",
        &JobStatusUpdate {
            id: first.id.clone(),
            status: JobStatus::Failure,
            message: Some("boom".into()),
            external_id: None,
        },
    )
    .await;

    let report = h.send("release-target.redeploy", &target()).await;

    assert_eq!(report.jobs_created.len(), 1);
    let again = &report.jobs_created[0];
    assert_ne!(again.id, first.id);
    assert_eq!(again.release_id, first.release_id);
    assert_eq!(
        h.workspace.store().jobs.get(&first.id).unwrap().message.as_deref(),
        Some("boom")
    );
}

#[tokio::test]
async fn unknown_targets_and_foreign_workspaces_are_rejected() {
    let h = Harness::new(t0());
    h.seed().await;

    let err = h
        .try_send("release-target.redeploy", &ReleaseTarget::new("r9", "e1", "d1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let envelope = Envelope::new(
        "other",
        "resource.created".parse().unwrap(),
        t0(),
        &Resource::new("r2", "cluster-2", t0()),
    )
    .unwrap();
    let err = h.workspace.apply(&envelope, &h.cancel).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(!h.workspace.store().resources.contains("r2"));
}
