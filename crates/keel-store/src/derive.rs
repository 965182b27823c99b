//! Release-target derivation
//!
//! A release target `(d, e, r)` exists iff all three entities exist, `d`
//! and `e` share at least one system, and both selectors admit `r`. The
//! `sync_*` functions bring the stored target set in line with that rule
//! for everything touching one entity, recording the difference in the
//! mutation context.

use crate::context::MutationContext;
use crate::error::Result;
use crate::store::Store;
use keel_types::{Deployment, Environment, ReleaseTarget, Resource};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Targets added and removed by one sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetDiff {
    pub added: Vec<ReleaseTarget>,
    pub removed: Vec<ReleaseTarget>,
}

impl TargetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    fn merge(&mut self, other: TargetDiff) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

impl Store {
    /// Whether `(deployment, environment, resource)` forms a release target
    ///
    /// Selector evaluation errors count as a non-match and are logged.
    pub fn forms_target(
        &self,
        deployment: &Deployment,
        environment: &Environment,
        resource: &Resource,
    ) -> bool {
        if !environment.shares_system(&deployment.system_ids) {
            return false;
        }
        let admitted = self
            .selectors()
            .matches_optional(deployment.resource_selector.as_ref(), resource)
            .and_then(|ok| {
                if !ok {
                    return Ok(false);
                }
                self.selectors()
                    .matches_optional(environment.resource_selector.as_ref(), resource)
            });
        match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(
                    deployment_id = %deployment.id,
                    environment_id = %environment.id,
                    resource_id = %resource.id,
                    error = %e,
                    "Selector evaluation failed; treating as non-match"
                );
                false
            }
        }
    }

    pub fn compute_targets_for_resource(&self, resource: &Resource) -> Vec<ReleaseTarget> {
        let environments = self.environments.values();
        let mut targets = Vec::new();
        for deployment in self.deployments.values() {
            for environment in &environments {
                if self.forms_target(&deployment, environment, resource) {
                    targets.push(ReleaseTarget::new(&resource.id, &environment.id, &deployment.id));
                }
            }
        }
        targets
    }

    pub fn compute_targets_for_deployment(&self, deployment: &Deployment) -> Vec<ReleaseTarget> {
        let environments: Vec<Environment> = self
            .environments
            .filter(|e| e.shares_system(&deployment.system_ids));
        let mut targets = Vec::new();
        for resource in self.resources.values() {
            for environment in &environments {
                if self.forms_target(deployment, environment, &resource) {
                    targets.push(ReleaseTarget::new(&resource.id, &environment.id, &deployment.id));
                }
            }
        }
        targets
    }

    pub fn compute_targets_for_environment(&self, environment: &Environment) -> Vec<ReleaseTarget> {
        let deployments: Vec<Deployment> = self
            .deployments
            .filter(|d| environment.shares_system(&d.system_ids));
        let mut targets = Vec::new();
        for resource in self.resources.values() {
            for deployment in &deployments {
                if self.forms_target(deployment, environment, &resource) {
                    targets.push(ReleaseTarget::new(&resource.id, &environment.id, &deployment.id));
                }
            }
        }
        targets
    }

    /// Reconcile targets referencing a resource; a missing resource drops them all
    pub fn sync_resource_targets(&self, ctx: &MutationContext, resource_id: &str) -> Result<TargetDiff> {
        let desired = match self.resources.get(resource_id) {
            Some(resource) => self.compute_targets_for_resource(&resource),
            None => Vec::new(),
        };
        let existing = self.targets_for_resource(resource_id);
        self.apply_targets(ctx, existing, desired)
    }

    pub fn sync_deployment_targets(&self, ctx: &MutationContext, deployment_id: &str) -> Result<TargetDiff> {
        let desired = match self.deployments.get(deployment_id) {
            Some(deployment) => self.compute_targets_for_deployment(&deployment),
            None => Vec::new(),
        };
        let existing = self.targets_for_deployment(deployment_id);
        self.apply_targets(ctx, existing, desired)
    }

    pub fn sync_environment_targets(&self, ctx: &MutationContext, environment_id: &str) -> Result<TargetDiff> {
        let desired = match self.environments.get(environment_id) {
            Some(environment) => self.compute_targets_for_environment(&environment),
            None => Vec::new(),
        };
        let existing = self.targets_for_environment(environment_id);
        self.apply_targets(ctx, existing, desired)
    }

    /// Re-derive every target in the workspace
    pub fn sync_all_targets(&self, ctx: &MutationContext) -> Result<TargetDiff> {
        let mut diff = TargetDiff::default();
        for resource in self.resources.values() {
            diff.merge(self.sync_resource_targets(ctx, &resource.id)?);
        }
        let orphaned: BTreeSet<String> = self
            .release_targets
            .values()
            .into_iter()
            .filter(|t| !self.resources.contains(&t.resource_id))
            .map(|t| t.resource_id)
            .collect();
        for resource_id in orphaned {
            diff.merge(self.sync_resource_targets(ctx, &resource_id)?);
        }
        Ok(diff)
    }

    fn apply_targets(
        &self,
        ctx: &MutationContext,
        existing: Vec<ReleaseTarget>,
        desired: Vec<ReleaseTarget>,
    ) -> Result<TargetDiff> {
        let existing: BTreeMap<String, ReleaseTarget> =
            existing.into_iter().map(|t| (t.key(), t)).collect();
        let desired: BTreeMap<String, ReleaseTarget> =
            desired.into_iter().map(|t| (t.key(), t)).collect();

        let mut diff = TargetDiff::default();
        for (key, target) in &existing {
            if !desired.contains_key(key) {
                self.release_targets.remove(ctx, key);
                diff.removed.push(target.clone());
            }
        }
        for (key, target) in desired {
            if !existing.contains_key(&key) {
                self.release_targets.upsert(ctx, target.clone())?;
                diff.added.push(target);
            }
        }
        if !diff.is_empty() {
            debug!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "Release targets reconciled"
            );
        }
        Ok(diff)
    }
}
