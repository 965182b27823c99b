//! Staging-then-production rollout through the release manager

use chrono::{TimeZone, Utc};
use keel_release::{
    Dispatcher, EligibilityChecker, Executor, Orchestrator, Planner, ReleaseManager, StateIndex,
};
use keel_selector::Selector;
use keel_store::{MutationContext, Store};
use keel_types::{
    CancelToken, Deployment, DeploymentVersion, Environment, Job, JobAgent, JobAgentConfig,
    JobStatus, ManualClock, Policy, PolicyRule, PolicyTargetSelector, Resource, RuleKind,
};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug)]
struct AcceptAll;

#[async_trait::async_trait]
impl Dispatcher for AcceptAll {
    async fn dispatch(&self, _job: &Job, _config: &JobAgentConfig) -> keel_release::Result<()> {
        Ok(())
    }
}

fn name_is(name: &str) -> Selector {
    Selector::Json(json!({"type": "name", "operator": "equals", "value": name}))
}

#[tokio::test]
async fn test_production_waits_for_staging_success() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let store = Arc::new(Store::default());
    let cancel = CancelToken::never();

    let planner = Planner::new(store.clone(), clock.clone());
    let orchestrator = Orchestrator::new(
        planner.clone(),
        EligibilityChecker::new(store.clone()),
        Executor::new(store.clone(), Arc::new(AcceptAll), clock.clone()),
    );
    let manager = ReleaseManager::new(
        store.clone(),
        Arc::new(StateIndex::new(planner)),
        orchestrator,
        clock.clone(),
    );
    let writes = MutationContext::detached();

    let setup = MutationContext::new();
    store
        .job_agents
        .upsert(
            &setup,
            JobAgent {
                id: "runner".into(),
                workspace_id: "ws".into(),
                name: "runner".into(),
                agent_type: "test-runner".into(),
                config: Default::default(),
            },
        )
        .unwrap();
    store
        .deployments
        .upsert(
            &setup,
            Deployment::new("api", "api")
                .with_systems(["core"])
                .with_job_agent("runner"),
        )
        .unwrap();
    for env in ["staging", "prod"] {
        store
            .environments
            .upsert(&setup, Environment::new(env, env, t0).with_systems(["core"]))
            .unwrap();
    }
    store
        .resources
        .upsert(&setup, Resource::new("cluster", "cluster", t0))
        .unwrap();
    store
        .policies
        .upsert(
            &setup,
            Policy::new("progression", "staging first", t0)
                .with_target(PolicyTargetSelector {
                    environment_selector: Some(name_is("prod")),
                    ..Default::default()
                })
                .with_rule(PolicyRule::new(
                    "after-staging",
                    RuleKind::EnvironmentProgression {
                        depends_on_environment_selector: name_is("staging"),
                    },
                )),
        )
        .unwrap();
    let diff = store.sync_all_targets(&setup).unwrap();
    assert_eq!(diff.added.len(), 2);

    let report = manager
        .process_changes(&writes, setup.changes().unwrap(), &cancel)
        .await
        .unwrap();
    assert!(report.jobs_created.is_empty());

    let release = MutationContext::new();
    store
        .deployment_versions
        .upsert(&release, DeploymentVersion::new("v1", "api", "1.0.0", t0))
        .unwrap();
    let report = manager
        .process_changes(&writes, release.changes().unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(report.jobs_created.len(), 1);
    let staging_job = report.jobs_created[0].clone();
    let staging_release = store.releases.get(&staging_job.release_id).unwrap();
    assert_eq!(staging_release.release_target.environment_id, "staging");

    let mut finished = store.jobs.get(&staging_job.id).unwrap();
    finished.transition(JobStatus::Successful, t0).unwrap();
    let update = MutationContext::new();
    store.jobs.upsert(&update, finished).unwrap();
    let report = manager
        .process_changes(&writes, update.changes().unwrap(), &cancel)
        .await
        .unwrap();

    assert_eq!(report.jobs_created.len(), 1);
    let prod_release = store
        .releases
        .get(&report.jobs_created[0].release_id)
        .unwrap();
    assert_eq!(prod_release.release_target.environment_id, "prod");
    assert_eq!(prod_release.version.id, "v1");
}
