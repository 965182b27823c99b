//! Event handlers: apply one envelope to the store
//!
//! Handlers only mutate the store (recording into the caller's change set)
//! and enqueue follow-up work. Reacting to the change set is the release
//! manager's job.

use crate::batch::BatchCache;
use crate::error::{EngineError, Result};
use crate::event::{Action, Envelope, Subject};
use crate::processors::{
    desired_release_work, selector_eval_work, SCOPE_DEPLOYMENT, SCOPE_ENVIRONMENT,
};
use keel_policy::EvaluatorFactory;
use keel_queue::ReconcileQueue;
use keel_store::{MutationContext, Store};
use keel_types::{
    ids::resource_variable_id, new_id, Clock, Deployment, DeploymentVariable, DeploymentVersion,
    EntityKind, Environment, JobAgent, JobStatus, JobVerification, Policy, ReleaseTarget,
    Resource, ResourceProvider, ResourceVariable, SharedClock, System, UserApprovalRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reference to an entity by id, as carried by delete events
#[derive(Debug, Clone, Deserialize)]
struct EntityRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceVariableRef {
    resource_id: String,
    key: String,
}

/// Payload of `resource-provider.set-resources`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetResources {
    pub provider_id: String,
    pub batch_id: String,
}

/// Payload of `job.status-updated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    /// Job id
    pub id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// What the caller still has to do after the store was updated
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Store updated; process the change set
    Applied,
    /// Operator asked to redeploy this target
    Redeploy(ReleaseTarget),
}

pub struct EventHandler {
    workspace_id: String,
    store: Arc<Store>,
    batches: Arc<BatchCache>,
    queue: Arc<dyn ReconcileQueue>,
    policies: EvaluatorFactory,
    clock: SharedClock,
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl EventHandler {
    pub fn new(
        workspace_id: impl Into<String>,
        store: Arc<Store>,
        batches: Arc<BatchCache>,
        queue: Arc<dyn ReconcileQueue>,
        clock: SharedClock,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            policies: EvaluatorFactory::new(store.clone(), clock.clone()),
            store,
            batches,
            queue,
            clock,
        }
    }

    pub async fn handle(&self, ctx: &MutationContext, envelope: &Envelope) -> Result<Handled> {
        let action = envelope.event_type.action;
        debug!(event_type = %envelope.event_type, "Handling event");
        match envelope.event_type.subject {
            Subject::Resource => self.resource(ctx, envelope, action)?,
            Subject::ResourceProvider => self.resource_provider(ctx, envelope, action)?,
            Subject::ResourceVariable => self.resource_variable(ctx, envelope, action)?,
            Subject::Deployment => self.deployment(ctx, envelope, action).await?,
            Subject::Environment => self.environment(ctx, envelope, action).await?,
            Subject::DeploymentVersion => {
                if action == Action::Deleted {
                    let EntityRef { id } = envelope.data()?;
                    self.store.deployment_versions.remove(ctx, &id);
                } else {
                    let version: DeploymentVersion = envelope.data()?;
                    self.store.deployment_versions.upsert(ctx, version)?;
                }
            }
            Subject::DeploymentVariable => self.deployment_variable(ctx, envelope, action)?,
            Subject::Policy => {
                if action == Action::Deleted {
                    let EntityRef { id } = envelope.data()?;
                    self.store.policies.remove(ctx, &id);
                } else {
                    let policy: Policy = envelope.data()?;
                    self.policies.validate(&policy)?;
                    self.store.policies.upsert(ctx, policy)?;
                }
            }
            Subject::JobAgent => {
                if action == Action::Deleted {
                    let EntityRef { id } = envelope.data()?;
                    self.store.job_agents.remove(ctx, &id);
                } else {
                    let agent: JobAgent = envelope.data()?;
                    self.store.job_agents.upsert(ctx, agent)?;
                }
            }
            Subject::System => {
                if action == Action::Deleted {
                    let EntityRef { id } = envelope.data()?;
                    self.store.systems.remove(ctx, &id);
                } else {
                    let system: System = envelope.data()?;
                    self.store.systems.upsert(ctx, system)?;
                }
            }
            Subject::Job => self.job_status(ctx, envelope)?,
            Subject::JobVerification => self.verification(ctx, envelope).await?,
            Subject::UserApproval => {
                let record: UserApprovalRecord = envelope.data()?;
                info!(
                    version_id = %record.version_id,
                    environment_id = %record.environment_id,
                    user_id = %record.user_id,
                    "Approval recorded"
                );
                self.store.user_approval_records.upsert(ctx, record)?;
            }
            Subject::ReleaseTarget => {
                let target: ReleaseTarget = envelope.data()?;
                if !self.store.release_targets.contains(&target.key()) {
                    return Err(EngineError::not_found(EntityKind::ReleaseTarget, target.key()));
                }
                return Ok(Handled::Redeploy(target));
            }
        }
        Ok(Handled::Applied)
    }

    fn resource(&self, ctx: &MutationContext, envelope: &Envelope, action: Action) -> Result<()> {
        let id = if action == Action::Deleted {
            let EntityRef { id } = envelope.data()?;
            self.remove_resource(ctx, &id);
            id
        } else {
            let resource: Resource = envelope.data()?;
            let id = resource.id.clone();
            self.store.resources.upsert(ctx, resource)?;
            id
        };
        self.store.sync_resource_targets(ctx, &id)?;
        Ok(())
    }

    fn remove_resource(&self, ctx: &MutationContext, id: &str) {
        for variable in self.store.variables_for_resource(id) {
            self.store.resource_variables.remove(ctx, &variable.id());
        }
        self.store.resources.remove(ctx, id);
    }

    fn resource_provider(
        &self,
        ctx: &MutationContext,
        envelope: &Envelope,
        action: Action,
    ) -> Result<()> {
        match action {
            Action::SetResources => {
                let update: SetResources = envelope.data()?;
                self.set_resources(ctx, &update)
            }
            Action::Deleted => {
                let EntityRef { id } = envelope.data()?;
                self.store.resource_providers.remove(ctx, &id);
                for resource in self.store.resources_for_provider(&id) {
                    self.remove_resource(ctx, &resource.id);
                    self.store.sync_resource_targets(ctx, &resource.id)?;
                }
                Ok(())
            }
            _ => {
                let provider: ResourceProvider = envelope.data()?;
                self.store.resource_providers.upsert(ctx, provider)?;
                Ok(())
            }
        }
    }

    /// Replace a provider's resource set with a claim-checked batch
    fn set_resources(&self, ctx: &MutationContext, update: &SetResources) -> Result<()> {
        let provider_id = update.provider_id.as_str();
        if !self.store.resource_providers.contains(provider_id) {
            return Err(EngineError::not_found(EntityKind::ResourceProvider, provider_id));
        }
        let batch = self
            .batches
            .take(&update.batch_id)
            .ok_or_else(|| EngineError::BatchMissing(update.batch_id.clone()))?;

        let now = self.clock.now();
        let by_identifier: HashMap<String, Resource> = self
            .store
            .resources
            .values()
            .into_iter()
            .map(|r| (r.identifier.clone(), r))
            .collect();

        let mut kept = HashSet::new();
        let mut touched = BTreeSet::new();
        let mut skipped = 0;
        for mut incoming in batch {
            incoming.provider_id = Some(provider_id.to_string());
            match by_identifier.get(&incoming.identifier) {
                Some(current)
                    if current
                        .provider_id
                        .as_deref()
                        .is_some_and(|owner| owner != provider_id) =>
                {
                    warn!(
                        identifier = %incoming.identifier,
                        owner = ?current.provider_id,
                        provider_id,
                        "Resource owned by another provider; skipped"
                    );
                    skipped += 1;
                    continue;
                }
                Some(current) => {
                    incoming.id = current.id.clone();
                    incoming.created_at = current.created_at;
                    incoming.updated_at = current.updated_at;
                    kept.insert(incoming.id.clone());
                    if &incoming == current {
                        continue;
                    }
                    incoming.updated_at = Some(now);
                }
                None => {
                    if incoming.id.is_empty() {
                        incoming.id = new_id();
                    }
                    kept.insert(incoming.id.clone());
                }
            }
            touched.insert(incoming.id.clone());
            self.store.resources.upsert(ctx, incoming)?;
        }

        let mut removed = 0;
        for resource in self.store.resources_for_provider(provider_id) {
            if !kept.contains(&resource.id) {
                self.remove_resource(ctx, &resource.id);
                touched.insert(resource.id);
                removed += 1;
            }
        }

        for id in &touched {
            self.store.sync_resource_targets(ctx, id)?;
        }
        info!(
            provider_id,
            changed = touched.len() - removed,
            removed,
            skipped,
            "Provider resources replaced"
        );
        Ok(())
    }

    fn resource_variable(
        &self,
        ctx: &MutationContext,
        envelope: &Envelope,
        action: Action,
    ) -> Result<()> {
        if action == Action::Deleted {
            let variable: ResourceVariableRef = envelope.data()?;
            self.store
                .resource_variables
                .remove(ctx, &resource_variable_id(&variable.resource_id, &variable.key));
        } else {
            let variable: ResourceVariable = envelope.data()?;
            self.store.resource_variables.upsert(ctx, variable)?;
        }
        Ok(())
    }

    async fn deployment(
        &self,
        ctx: &MutationContext,
        envelope: &Envelope,
        action: Action,
    ) -> Result<()> {
        if action == Action::Deleted {
            let EntityRef { id } = envelope.data()?;
            self.store.deployments.remove(ctx, &id);
            for version in self.store.deployment_versions.get_by_group(&id) {
                self.store.deployment_versions.remove(ctx, &version.id);
            }
            for variable in self.store.variables_for_deployment(&id) {
                self.store.deployment_variables.remove(ctx, &variable.id);
            }
            self.store.sync_deployment_targets(ctx, &id)?;
            return Ok(());
        }

        let deployment: Deployment = envelope.data()?;
        if let Some(selector) = &deployment.resource_selector {
            self.store
                .selectors()
                .validate(selector)
                .map_err(|e| EngineError::Validation(format!("deployment {}: {}", deployment.id, e)))?;
        }
        let id = deployment.id.clone();
        let previous = self.store.deployments.upsert(ctx, deployment.clone())?;
        let reselect = previous.map_or(true, |p| {
            p.resource_selector != deployment.resource_selector
                || p.system_ids != deployment.system_ids
        });
        if reselect {
            self.queue
                .enqueue(selector_eval_work(&self.workspace_id, SCOPE_DEPLOYMENT, &id))
                .await?;
        }
        Ok(())
    }

    async fn environment(
        &self,
        ctx: &MutationContext,
        envelope: &Envelope,
        action: Action,
    ) -> Result<()> {
        if action == Action::Deleted {
            let EntityRef { id } = envelope.data()?;
            self.store.environments.remove(ctx, &id);
            self.store.sync_environment_targets(ctx, &id)?;
            return Ok(());
        }

        let environment: Environment = envelope.data()?;
        if let Some(selector) = &environment.resource_selector {
            self.store
                .selectors()
                .validate(selector)
                .map_err(|e| EngineError::Validation(format!("environment {}: {}", environment.id, e)))?;
        }
        let id = environment.id.clone();
        let previous = self.store.environments.upsert(ctx, environment.clone())?;
        let reselect = previous.map_or(true, |p| {
            p.resource_selector != environment.resource_selector
                || p.system_ids != environment.system_ids
        });
        if reselect {
            self.queue
                .enqueue(selector_eval_work(&self.workspace_id, SCOPE_ENVIRONMENT, &id))
                .await?;
        }
        Ok(())
    }

    fn deployment_variable(
        &self,
        ctx: &MutationContext,
        envelope: &Envelope,
        action: Action,
    ) -> Result<()> {
        if action == Action::Deleted {
            let EntityRef { id } = envelope.data()?;
            self.store.deployment_variables.remove(ctx, &id);
            return Ok(());
        }
        let variable: DeploymentVariable = envelope.data()?;
        for value in &variable.values {
            if let Some(selector) = &value.resource_selector {
                self.store.selectors().validate(selector).map_err(|e| {
                    EngineError::Validation(format!("variable {} value {}: {}", variable.key, value.id, e))
                })?;
            }
        }
        self.store.deployment_variables.upsert(ctx, variable)?;
        Ok(())
    }

    fn job_status(&self, ctx: &MutationContext, envelope: &Envelope) -> Result<()> {
        let update: JobStatusUpdate = envelope.data()?;
        let mut job = self
            .store
            .jobs
            .get(&update.id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, &update.id))?;
        let previous = job.status;
        job.transition(update.status, self.clock.now())?;
        if update.message.is_some() {
            job.message = update.message;
        }
        if update.external_id.is_some() {
            job.external_id = update.external_id;
        }
        info!(job_id = %job.id, from = %previous, to = %job.status, "Job status updated");
        self.store.jobs.upsert(ctx, job)?;
        Ok(())
    }

    /// Store the verification and queue a re-plan of its target
    async fn verification(&self, ctx: &MutationContext, envelope: &Envelope) -> Result<()> {
        let verification: JobVerification = envelope.data()?;
        let target = self
            .store
            .jobs
            .get(&verification.job_id)
            .and_then(|job| self.store.releases.get(&job.release_id))
            .map(|release| release.release_target)
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, &verification.job_id))?;
        self.store.job_verifications.upsert(ctx, verification)?;
        self.queue
            .enqueue(desired_release_work(&self.workspace_id, &target, "verification"))
            .await?;
        Ok(())
    }
}
