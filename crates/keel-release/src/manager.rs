//! Release manager
//!
//! Consumes the change set of one logical ingest unit: maps every changed
//! entity onto the release targets it affects, refreshes the state index
//! and reconciles the targets whose desired release is not yet deployed.

use crate::error::{ReleaseError, Result};
use crate::orchestrator::Orchestrator;
use crate::state::StateIndex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_store::{ChangeType, MutationContext, Store, StoreChangeSet};
use keel_types::{CancelToken, EntityRecord, Job, JobStatus, ReleaseTarget, SharedClock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Arranges a later re-plan of a target whose rules are waiting on time
#[async_trait]
pub trait ReevaluationScheduler: Send + Sync + fmt::Debug {
    async fn schedule(&self, target: &ReleaseTarget, at: DateTime<Utc>) -> Result<()>;
}

/// How much of a target's state a change invalidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalidation {
    CurrentAndJob,
    Desired,
    All,
}

impl Invalidation {
    /// Components touched by either side
    fn union(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            Invalidation::All
        }
    }
}

/// Summary of one `process_changes` call
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub targets_affected: usize,
    pub recomputed: usize,
    pub jobs_created: Vec<Job>,
    pub jobs_cancelled: Vec<String>,
    pub reevaluations_scheduled: usize,
    /// Target key and error text of targets that failed to reconcile
    pub failures: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct ReleaseManager {
    store: Arc<Store>,
    state: Arc<StateIndex>,
    orchestrator: Orchestrator,
    scheduler: Option<Arc<dyn ReevaluationScheduler>>,
    clock: SharedClock,
}

impl ReleaseManager {
    pub fn new(
        store: Arc<Store>,
        state: Arc<StateIndex>,
        orchestrator: Orchestrator,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            state,
            orchestrator,
            scheduler: None,
            clock,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn ReevaluationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn state(&self) -> &Arc<StateIndex> {
        &self.state
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// React to one change set
    ///
    /// Writes made while reconciling (releases, jobs) go through `ctx`.
    /// Per-target failures are logged and reported, never returned.
    #[instrument(skip_all, fields(changes = changes.len()))]
    pub async fn process_changes(
        &self,
        ctx: &MutationContext,
        changes: &StoreChangeSet,
        cancel: &CancelToken,
    ) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let mut affected: BTreeMap<String, Invalidation> = BTreeMap::new();

        for change in changes.dedup().process().iter() {
            match &change.entity {
                EntityRecord::ReleaseTarget(target) => {
                    let key = target.key();
                    if change.change_type == ChangeType::Delete
                        || !self.store.release_targets.contains(&key)
                    {
                        self.retire_target(ctx, target, &mut report)?;
                        affected.remove(&key);
                    } else {
                        self.state.touch(&key);
                        widen(&mut affected, key, Invalidation::All);
                    }
                }
                entity => {
                    for (target, invalidation) in self.cascade(entity) {
                        widen(&mut affected, target.key(), invalidation);
                    }
                }
            }
        }

        for (key, invalidation) in &affected {
            if !self.state.contains(key) {
                self.state.add_target(key);
                continue;
            }
            match invalidation {
                Invalidation::All => self.state.dirty_all(key),
                Invalidation::Desired => self.state.dirty_desired(key),
                Invalidation::CurrentAndJob => self.state.dirty_current_and_job(key),
            }
        }
        report.targets_affected = affected.len();
        report.recomputed = self.state.recompute(cancel).await?;

        let keys: Vec<String> = affected.into_keys().collect();
        self.settle(ctx, &keys, cancel, &mut report).await?;
        Ok(report)
    }

    /// Re-plan one target and reconcile it if needed
    #[instrument(skip(self, ctx, cancel), fields(target_key = %target.key()))]
    pub async fn reconcile_target(
        &self,
        ctx: &MutationContext,
        target: &ReleaseTarget,
        cancel: &CancelToken,
    ) -> Result<ProcessReport> {
        let key = target.key();
        let mut report = ProcessReport {
            targets_affected: 1,
            ..Default::default()
        };
        self.state.touch(&key);
        report.recomputed = self.state.recompute(cancel).await?;
        self.settle(ctx, &[key], cancel, &mut report).await?;
        Ok(report)
    }

    /// Operator redeploy: reconcile with eligibility bypassed
    #[instrument(skip(self, ctx, cancel), fields(target_key = %target.key()))]
    pub async fn redeploy(
        &self,
        ctx: &MutationContext,
        target: &ReleaseTarget,
        cancel: &CancelToken,
    ) -> Result<Option<Job>> {
        let reconciliation = self.orchestrator.reconcile(ctx, target, true, None).await?;
        let key = target.key();
        self.state.touch(&key);
        self.state.recompute(cancel).await?;
        if let Some(job) = &reconciliation.job {
            info!(job_id = %job.id, "Redeploy job created");
        }
        Ok(reconciliation.job)
    }

    async fn settle(
        &self,
        ctx: &MutationContext,
        keys: &[String],
        cancel: &CancelToken,
        report: &mut ProcessReport,
    ) -> Result<()> {
        let mut reconciled = Vec::new();

        for key in keys {
            if cancel.is_cancelled() {
                return Err(ReleaseError::Cancelled);
            }
            let Some(target) = self.store.release_targets.get(key) else {
                continue;
            };
            if self.state.is_dirty(key) {
                debug!(target_key = %key, "State still dirty; reconciliation deferred");
                continue;
            }
            let snapshot = self.state.peek(key);

            if let Some(at) = snapshot
                .desired
                .as_ref()
                .and_then(|d| d.next_evaluation_time)
            {
                self.schedule(&target, at, report).await;
            }

            if !snapshot.needs_reconcile() {
                continue;
            }

            match self.orchestrator.reconcile(ctx, &target, false, None).await {
                Ok(result) => {
                    if let Some(job) = result.job {
                        report.jobs_created.push(job);
                        reconciled.push(key.clone());
                    }
                }
                Err(e) => {
                    warn!(target_key = %key, error = %e, "Reconciliation failed");
                    report.failures.push((key.clone(), e.to_string()));
                }
            }
        }

        if !reconciled.is_empty() {
            for key in &reconciled {
                self.state.dirty_current_and_job(key);
            }
            report.recomputed += self.state.recompute(cancel).await?;
        }
        Ok(())
    }

    async fn schedule(&self, target: &ReleaseTarget, at: DateTime<Utc>, report: &mut ProcessReport) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        match scheduler.schedule(target, at).await {
            Ok(()) => report.reevaluations_scheduled += 1,
            Err(e) => {
                warn!(target_key = %target.key(), error = %e, "Failed to schedule re-evaluation");
            }
        }
    }

    /// Cancel the target's processing jobs and drop it from the index
    fn retire_target(
        &self,
        ctx: &MutationContext,
        target: &ReleaseTarget,
        report: &mut ProcessReport,
    ) -> Result<()> {
        let now = self.clock.now();
        for mut job in self.store.processing_jobs_for_target(target) {
            job.transition(JobStatus::Cancelled, now)?;
            self.store.jobs.upsert(ctx, job.clone())?;
            info!(job_id = %job.id, target_key = %target.key(), "Job cancelled; release target removed");
            report.jobs_cancelled.push(job.id);
        }
        self.state.remove_target(&target.key());
        Ok(())
    }

    /// Release targets affected by a change to a non-target entity
    fn cascade(&self, entity: &EntityRecord) -> Vec<(ReleaseTarget, Invalidation)> {
        let store = &self.store;
        let with = |targets: Vec<ReleaseTarget>, invalidation| {
            targets
                .into_iter()
                .map(|t| (t, invalidation))
                .collect::<Vec<_>>()
        };
        match entity {
            EntityRecord::Resource(r) => with(store.targets_for_resource(&r.id), Invalidation::All),
            EntityRecord::Environment(e) => {
                with(store.targets_for_environment(&e.id), Invalidation::All)
            }
            EntityRecord::Deployment(d) => {
                with(store.targets_for_deployment(&d.id), Invalidation::All)
            }
            EntityRecord::DeploymentVersion(v) => {
                with(store.targets_for_deployment(&v.deployment_id), Invalidation::Desired)
            }
            EntityRecord::DeploymentVariable(v) => {
                with(store.targets_for_deployment(&v.deployment_id), Invalidation::Desired)
            }
            EntityRecord::ResourceVariable(v) => {
                with(store.targets_for_resource(&v.resource_id), Invalidation::Desired)
            }
            EntityRecord::UserApprovalRecord(a) => {
                with(store.targets_for_environment(&a.environment_id), Invalidation::Desired)
            }
            EntityRecord::Policy(_) => {
                with(store.release_targets.values(), Invalidation::Desired)
            }
            EntityRecord::Job(job) => self.job_targets(&job.release_id),
            EntityRecord::JobVerification(v) => store
                .jobs
                .get(&v.job_id)
                .and_then(|job| store.releases.get(&job.release_id))
                .map(|release| vec![(release.release_target, Invalidation::CurrentAndJob)])
                .unwrap_or_default(),
            EntityRecord::Release(_)
            | EntityRecord::ReleaseTarget(_)
            | EntityRecord::JobAgent(_)
            | EntityRecord::ResourceProvider(_)
            | EntityRecord::System(_) => Vec::new(),
        }
    }

    /// A job's own target, plus the targets whose rules read its outcome
    ///
    /// Progression and cooldown depend on jobs of the same deployment;
    /// deployment dependencies on jobs of the same resource.
    fn job_targets(&self, release_id: &str) -> Vec<(ReleaseTarget, Invalidation)> {
        let Some(release) = self.store.releases.get(release_id) else {
            return Vec::new();
        };
        let own = release.release_target;
        let mut targets: Vec<(ReleaseTarget, Invalidation)> = self
            .store
            .targets_for_deployment(&own.deployment_id)
            .into_iter()
            .chain(self.store.targets_for_resource(&own.resource_id))
            .filter(|t| *t != own)
            .map(|t| (t, Invalidation::Desired))
            .collect();
        targets.push((own, Invalidation::All));
        targets
    }
}

fn widen(affected: &mut BTreeMap<String, Invalidation>, key: String, invalidation: Invalidation) {
    affected
        .entry(key)
        .and_modify(|entry| *entry = entry.union(invalidation))
        .or_insert(invalidation);
}
