//! Executor: persist a release, create its job and hand it to an integration

use crate::error::{ReleaseError, Result};
use async_trait::async_trait;
use keel_store::{MutationContext, Store};
use keel_types::{
    new_id, Deployment, EntityKind, Job, JobAgentConfig, JobStatus, Release, SharedClock,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Hands jobs to the integration that runs them
#[async_trait]
pub trait Dispatcher: Send + Sync + fmt::Debug {
    async fn dispatch(&self, job: &Job, config: &JobAgentConfig) -> Result<()>;
}

/// Resolved agent for a deployment
struct AgentBinding {
    agent_id: String,
    merged: Value,
    config: JobAgentConfig,
}

#[derive(Debug, Clone)]
pub struct Executor {
    store: Arc<Store>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: SharedClock,
}

impl Executor {
    pub fn new(store: Arc<Store>, dispatcher: Arc<dyn Dispatcher>, clock: SharedClock) -> Self {
        Self {
            store,
            dispatcher,
            clock,
        }
    }

    /// Upsert `release`, create a pending job for it and dispatch the job
    ///
    /// Agent misconfiguration and dispatch failures are recorded on the job
    /// (`invalidJobAgent`, `invalidIntegration`) rather than returned.
    #[instrument(skip(self, ctx, release), fields(release_id = %release.id, target_key = %release.target_key()))]
    pub async fn execute(&self, ctx: &MutationContext, release: &Release) -> Result<Job> {
        let deployment = self
            .store
            .deployments
            .get(&release.release_target.deployment_id)
            .ok_or_else(|| {
                ReleaseError::not_found(
                    EntityKind::Deployment,
                    &release.release_target.deployment_id,
                )
            })?;

        let mut stored = release.clone();
        if let Some(existing) = self.store.releases.get(&release.id) {
            stored.created_at = existing.created_at;
        }
        self.store.releases.upsert(ctx, stored)?;

        let now = self.clock.now();
        let mut job = Job::pending(new_id(), &release.id, now);

        let binding = match self.bind_agent(&deployment) {
            Ok(binding) => binding,
            Err(message) => {
                warn!(job_id = %job.id, error = %message, "Job agent unusable");
                job.transition(JobStatus::InvalidJobAgent, now)?;
                job.message = Some(message);
                self.store.jobs.upsert(ctx, job.clone())?;
                return Ok(job);
            }
        };

        job.job_agent_id = Some(binding.agent_id);
        job.job_agent_config = binding.merged;
        self.store.jobs.upsert(ctx, job.clone())?;
        info!(
            job_id = %job.id,
            agent_type = binding.config.type_name(),
            version = %release.version.tag,
            "Job created"
        );

        if let Err(e) = self.dispatcher.dispatch(&job, &binding.config).await {
            warn!(job_id = %job.id, error = %e, "Dispatch failed");
            job.transition(JobStatus::InvalidIntegration, self.clock.now())?;
            job.message = Some(e.to_string());
            self.store.jobs.upsert(ctx, job.clone())?;
        }

        Ok(job)
    }

    fn bind_agent(&self, deployment: &Deployment) -> std::result::Result<AgentBinding, String> {
        let agent_id = deployment
            .job_agent_id
            .as_deref()
            .ok_or_else(|| format!("deployment {} has no job agent", deployment.id))?;
        let agent = self
            .store
            .job_agents
            .get(agent_id)
            .ok_or_else(|| format!("job agent {} not found", agent_id))?;
        let merged = agent.merged_config(&deployment.job_agent_config);
        let config = JobAgentConfig::parse(&merged).map_err(|e| e.to_string())?;
        Ok(AgentBinding {
            agent_id: agent.id,
            merged,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, RecordingDispatcher};
    use keel_types::JobAgent;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn release(f: &crate::testing::Fixture) -> Release {
        let version = f.store.deployment_versions.get("v1").unwrap();
        Release::new(f.target(), version, BTreeMap::new(), f.t0)
    }

    #[tokio::test]
    async fn test_execute_creates_and_dispatches() {
        let f = fixture();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let executor = Executor::new(f.store.clone(), dispatcher.clone(), Arc::new(f.clock.clone()));

        let release = release(&f);
        let job = executor
            .execute(&MutationContext::detached(), &release)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.release_id, release.id);
        assert_eq!(job.job_agent_id.as_deref(), Some("agent-1"));
        assert_eq!(job.job_agent_config["type"], json!("test-runner"));
        assert!(f.store.releases.get(&release.id).is_some());
        assert_eq!(f.store.jobs.get(&job.id).unwrap().status, JobStatus::Pending);
        assert_eq!(dispatcher.dispatched(), vec![job.id.clone()]);
    }

    #[tokio::test]
    async fn test_redeploying_a_release_keeps_its_creation_time() {
        let f = fixture();
        let executor = Executor::new(
            f.store.clone(),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(f.clock.clone()),
        );
        let ctx = MutationContext::detached();
        let first = release(&f);
        executor.execute(&ctx, &first).await.unwrap();

        let mut again = first.clone();
        again.created_at = f.t0 + chrono::Duration::hours(1);
        let job = executor.execute(&ctx, &again).await.unwrap();

        assert_eq!(job.release_id, first.id);
        assert_eq!(f.store.releases.get(&first.id).unwrap().created_at, f.t0);
        assert_eq!(f.store.jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_agent_marks_job_invalid() {
        let f = fixture();
        f.store
            .job_agents
            .remove(&MutationContext::detached(), "agent-1");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let executor = Executor::new(f.store.clone(), dispatcher.clone(), Arc::new(f.clock.clone()));

        let job = executor
            .execute(&MutationContext::detached(), &release(&f))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::InvalidJobAgent);
        assert!(job.message.unwrap().contains("agent-1"));
        assert!(dispatcher.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_agent_config() {
        let f = fixture();
        let agent = JobAgent {
            id: "agent-1".into(),
            workspace_id: String::new(),
            name: "gh".into(),
            agent_type: "github-app".into(),
            config: json!({"owner": "acme"}).as_object().cloned().unwrap(),
        };
        f.store
            .job_agents
            .upsert(&MutationContext::detached(), agent)
            .unwrap();
        let executor = Executor::new(
            f.store.clone(),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(f.clock.clone()),
        );

        let job = executor
            .execute(&MutationContext::detached(), &release(&f))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::InvalidJobAgent);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_integration_invalid() {
        let f = fixture();
        let dispatcher = Arc::new(RecordingDispatcher::failing("connection refused"));
        let executor = Executor::new(f.store.clone(), dispatcher, Arc::new(f.clock.clone()));

        let job = executor
            .execute(&MutationContext::detached(), &release(&f))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::InvalidIntegration);
        assert!(job.message.unwrap().contains("connection refused"));
        assert_eq!(
            f.store.jobs.get(&job.id).unwrap().status,
            JobStatus::InvalidIntegration
        );
    }
}
