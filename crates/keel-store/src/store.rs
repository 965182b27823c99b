//! The workspace store: one repository per entity kind

use crate::repository::{IndexedRepository, Repository};
use keel_selector::SelectorEvaluator;
use keel_types::{
    ApprovalStatus, Deployment, DeploymentVariable, DeploymentVersion, Environment, Job, JobAgent,
    JobVerification, Policy, Release, ReleaseTarget, Resource, ResourceProvider, ResourceVariable,
    System, UserApprovalRecord,
};
use std::fmt;

/// All repositories of one workspace
///
/// Repositories are individually synchronized; the store is not
/// transactional across them.
pub struct Store {
    pub resources: Repository<Resource>,
    pub resource_providers: Repository<ResourceProvider>,
    pub resource_variables: IndexedRepository<ResourceVariable>,
    pub systems: Repository<System>,
    pub deployments: Repository<Deployment>,
    pub deployment_versions: IndexedRepository<DeploymentVersion>,
    pub deployment_variables: IndexedRepository<DeploymentVariable>,
    pub environments: Repository<Environment>,
    pub release_targets: IndexedRepository<ReleaseTarget>,
    pub releases: IndexedRepository<Release>,
    pub jobs: IndexedRepository<Job>,
    pub job_agents: Repository<JobAgent>,
    pub job_verifications: IndexedRepository<JobVerification>,
    pub policies: Repository<Policy>,
    pub user_approval_records: Repository<UserApprovalRecord>,
    selectors: SelectorEvaluator,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("resources", &self.resources.len())
            .field("deployments", &self.deployments.len())
            .field("environments", &self.environments.len())
            .field("release_targets", &self.release_targets.len())
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(SelectorEvaluator::new())
    }
}

impl Store {
    pub fn new(selectors: SelectorEvaluator) -> Self {
        Self {
            resources: Repository::new(),
            resource_providers: Repository::new(),
            resource_variables: IndexedRepository::new(|v| v.resource_id.clone()),
            systems: Repository::new(),
            deployments: Repository::new(),
            deployment_versions: IndexedRepository::new(|v| v.deployment_id.clone()),
            deployment_variables: IndexedRepository::new(|v| v.deployment_id.clone()),
            environments: Repository::new(),
            release_targets: IndexedRepository::new(|t| t.resource_id.clone()),
            releases: IndexedRepository::new(|r| r.release_target.key()),
            jobs: IndexedRepository::new(|j| j.release_id.clone()),
            job_agents: Repository::new(),
            job_verifications: IndexedRepository::new(|v| v.job_id.clone()),
            policies: Repository::new(),
            user_approval_records: Repository::new(),
            selectors,
        }
    }

    pub fn selectors(&self) -> &SelectorEvaluator {
        &self.selectors
    }

    /// Versions of a deployment, newest first; equal times order by tag descending
    pub fn versions_for_deployment(&self, deployment_id: &str) -> Vec<DeploymentVersion> {
        let mut versions = self.deployment_versions.get_by_group(deployment_id);
        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.tag.cmp(&a.tag))
        });
        versions
    }

    /// Approve records for a version in an environment
    pub fn approvals_for(&self, version_id: &str, environment_id: &str) -> Vec<UserApprovalRecord> {
        self.user_approval_records.filter(|r| {
            r.version_id == version_id
                && r.environment_id == environment_id
                && r.status == ApprovalStatus::Approved
        })
    }

    pub fn verifications_for_job(&self, job_id: &str) -> Vec<JobVerification> {
        let mut verifications = self.job_verifications.get_by_group(job_id);
        verifications.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        verifications
    }

    pub fn variables_for_deployment(&self, deployment_id: &str) -> Vec<DeploymentVariable> {
        let mut variables = self.deployment_variables.get_by_group(deployment_id);
        variables.sort_by(|a, b| a.key.cmp(&b.key));
        variables
    }

    pub fn variables_for_resource(&self, resource_id: &str) -> Vec<ResourceVariable> {
        self.resource_variables.get_by_group(resource_id)
    }

    /// Resources owned by a provider
    pub fn resources_for_provider(&self, provider_id: &str) -> Vec<Resource> {
        self.resources
            .filter(|r| r.provider_id.as_deref() == Some(provider_id))
    }

    /// Enabled policies with a target selector admitting `target`
    ///
    /// Selector errors exclude the policy for this target and are logged.
    pub fn policies_for_target(&self, target: &ReleaseTarget) -> Vec<Policy> {
        let (Some(deployment), Some(environment), Some(resource)) = (
            self.deployments.get(&target.deployment_id),
            self.environments.get(&target.environment_id),
            self.resources.get(&target.resource_id),
        ) else {
            return Vec::new();
        };

        let mut policies: Vec<Policy> = self
            .policies
            .filter(|p| p.enabled)
            .into_iter()
            .filter(|policy| {
                policy.target_selectors.iter().any(|ts| {
                    let admitted = self
                        .selectors
                        .matches_optional(ts.deployment_selector.as_ref(), &deployment)
                        .and_then(|ok| {
                            if !ok {
                                return Ok(false);
                            }
                            self.selectors
                                .matches_optional(ts.environment_selector.as_ref(), &environment)
                        })
                        .and_then(|ok| {
                            if !ok {
                                return Ok(false);
                            }
                            self.selectors
                                .matches_optional(ts.resource_selector.as_ref(), &resource)
                        });
                    match admitted {
                        Ok(admitted) => admitted,
                        Err(e) => {
                            tracing::warn!(
                                policy_id = %policy.id,
                                target_key = %target.key(),
                                error = %e,
                                "Policy target selector failed; policy skipped for target"
                            );
                            false
                        }
                    }
                })
            })
            .collect();
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        policies
    }
}
