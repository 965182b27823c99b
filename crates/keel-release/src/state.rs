//! Per-target state index: desired release, current release, latest job

use crate::error::{ReleaseError, Result};
use crate::index::{Compute, ComputedIndex};
use crate::planner::{DesiredRelease, Planner};
use async_trait::async_trait;
use keel_store::Store;
use keel_types::{CancelToken, EntityKind, Job, JobVerification, Release, ReleaseTarget};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A job together with its verifications, oldest first
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobWithVerifications {
    pub job: Job,
    pub verifications: Vec<JobVerification>,
}

/// Snapshot of one target's indexed state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    pub desired: Option<DesiredRelease>,
    pub current: Option<Release>,
    pub latest_job: Option<JobWithVerifications>,
}

impl TargetState {
    /// Desired release is deployable and neither deployed nor the latest job's
    pub fn needs_reconcile(&self) -> bool {
        let Some(desired) = self.desired.as_ref().filter(|d| d.can_deploy) else {
            return false;
        };
        let desired_id = desired.release.id.as_str();
        let deployed = self.current.as_ref().is_some_and(|r| r.id == desired_id);
        let attempted = self
            .latest_job
            .as_ref()
            .is_some_and(|j| j.job.release_id == desired_id);
        !(deployed && attempted)
    }
}

fn target_for(store: &Store, key: &str) -> Result<ReleaseTarget> {
    store
        .release_targets
        .get(key)
        .ok_or_else(|| ReleaseError::not_found(EntityKind::ReleaseTarget, key))
}

struct DesiredCompute {
    planner: Planner,
}

#[async_trait]
impl Compute<Option<DesiredRelease>> for DesiredCompute {
    async fn compute(&self, key: &str) -> Result<Option<DesiredRelease>> {
        let target = target_for(self.planner.store(), key)?;
        self.planner.plan(&target, None).await
    }
}

struct CurrentCompute {
    store: Arc<Store>,
}

#[async_trait]
impl Compute<Option<Release>> for CurrentCompute {
    async fn compute(&self, key: &str) -> Result<Option<Release>> {
        let target = target_for(&self.store, key)?;
        Ok(self
            .store
            .get_current_release(&target)
            .map(|(release, _)| release))
    }
}

struct LatestJobCompute {
    store: Arc<Store>,
}

#[async_trait]
impl Compute<Option<JobWithVerifications>> for LatestJobCompute {
    async fn compute(&self, key: &str) -> Result<Option<JobWithVerifications>> {
        let target = target_for(&self.store, key)?;
        Ok(self.store.get_latest_job(&target).map(|job| {
            let verifications = self.store.verifications_for_job(&job.id);
            JobWithVerifications { job, verifications }
        }))
    }
}

/// Three computed indexes keyed by release-target key
#[derive(Debug)]
pub struct StateIndex {
    store: Arc<Store>,
    desired: ComputedIndex<Option<DesiredRelease>>,
    current: ComputedIndex<Option<Release>>,
    latest_job: ComputedIndex<Option<JobWithVerifications>>,
}

impl StateIndex {
    pub fn new(planner: Planner) -> Self {
        let store = planner.store().clone();
        Self {
            desired: ComputedIndex::new("desired-release", Arc::new(DesiredCompute { planner })),
            current: ComputedIndex::new(
                "current-release",
                Arc::new(CurrentCompute {
                    store: store.clone(),
                }),
            ),
            latest_job: ComputedIndex::new(
                "latest-job",
                Arc::new(LatestJobCompute {
                    store: store.clone(),
                }),
            ),
            store,
        }
    }

    pub fn add_target(&self, key: &str) {
        self.desired.add_entity(key);
        self.current.add_entity(key);
        self.latest_job.add_entity(key);
    }

    pub fn remove_target(&self, key: &str) {
        self.desired.remove_entity(key);
        self.current.remove_entity(key);
        self.latest_job.remove_entity(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.desired.contains(key)
    }

    pub fn dirty_desired(&self, key: &str) {
        self.desired.dirty_entity(key);
    }

    /// Verification and job updates; desired is left alone
    pub fn dirty_current_and_job(&self, key: &str) {
        self.current.dirty_entity(key);
        self.latest_job.dirty_entity(key);
    }

    pub fn dirty_all(&self, key: &str) {
        self.dirty_desired(key);
        self.dirty_current_and_job(key);
    }

    /// Register `key` if unknown, otherwise dirty every component
    pub fn touch(&self, key: &str) {
        if self.contains(key) {
            self.dirty_all(key);
        } else {
            self.add_target(key);
        }
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.desired.is_dirty(key) || self.current.is_dirty(key) || self.latest_job.is_dirty(key)
    }

    /// Recompute all dirty keys of every index
    pub async fn recompute(&self, cancel: &CancelToken) -> Result<usize> {
        let desired = self.desired.recompute(cancel).await?;
        let current = self.current.recompute(cancel).await?;
        let latest = self.latest_job.recompute(cancel).await?;
        Ok(desired + current + latest)
    }

    /// Indexed state without computing
    pub fn peek(&self, key: &str) -> TargetState {
        TargetState {
            desired: self.desired.get(key).flatten(),
            current: self.current.get(key).flatten(),
            latest_job: self.latest_job.get(key).flatten(),
        }
    }

    /// Indexed state, registering and computing the target on first access
    ///
    /// Covers targets restored from persistence that never went through a
    /// change set.
    pub async fn get(&self, target: &ReleaseTarget, cancel: &CancelToken) -> Result<TargetState> {
        let key = target.key();
        if !self.contains(&key) {
            if !self.store.release_targets.contains(&key) {
                return Err(ReleaseError::not_found(EntityKind::ReleaseTarget, key));
            }
            debug!(target_key = %key, "Lazily indexing target");
            self.add_target(&key);
            self.recompute(cancel).await?;
        }
        Ok(self.peek(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deploy, fixture};
    use keel_types::JobStatus;

    #[tokio::test]
    async fn test_lazy_get_computes_all_components() {
        let f = fixture();
        let state = StateIndex::new(f.planner());
        deploy(&f.store, &f.target(), "v1", JobStatus::Successful, f.t0);

        let snapshot = state.get(&f.target(), &CancelToken::never()).await.unwrap();
        let desired = snapshot.desired.as_ref().unwrap();
        assert_eq!(desired.release.version.id, "v1");
        assert_eq!(snapshot.current.as_ref().unwrap().id, desired.release.id);
        assert_eq!(
            snapshot.latest_job.as_ref().unwrap().job.release_id,
            desired.release.id
        );
        assert!(!snapshot.needs_reconcile());
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let f = fixture();
        let state = StateIndex::new(f.planner());
        let err = state
            .get(&ReleaseTarget::new("x", "e1", "d1"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_dirty_current_and_job_leaves_desired_clean() {
        let f = fixture();
        let state = StateIndex::new(f.planner());
        let key = f.target().key();
        state.add_target(&key);
        state.recompute(&CancelToken::never()).await.unwrap();

        state.dirty_current_and_job(&key);
        assert!(state.is_dirty(&key));
        assert!(!state.desired.is_dirty(&key));

        deploy(&f.store, &f.target(), "v1", JobStatus::InProgress, f.t0);
        state.recompute(&CancelToken::never()).await.unwrap();
        let snapshot = state.peek(&key);
        assert_eq!(
            snapshot.latest_job.unwrap().job.status,
            JobStatus::InProgress
        );
        assert!(snapshot.current.is_none());
    }

    #[tokio::test]
    async fn test_needs_reconcile_for_undeployed_target() {
        let f = fixture();
        let state = StateIndex::new(f.planner());
        let snapshot = state.get(&f.target(), &CancelToken::never()).await.unwrap();
        assert!(snapshot.needs_reconcile());
    }
}
