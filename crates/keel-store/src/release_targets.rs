//! Release-target queries over releases and jobs

use crate::store::Store;
use keel_types::{Job, Release, ReleaseTarget};

impl Store {
    /// Release targets referencing a resource
    pub fn targets_for_resource(&self, resource_id: &str) -> Vec<ReleaseTarget> {
        self.release_targets.get_by_group(resource_id)
    }

    pub fn targets_for_deployment(&self, deployment_id: &str) -> Vec<ReleaseTarget> {
        self.release_targets
            .filter(|t| t.deployment_id == deployment_id)
    }

    pub fn targets_for_environment(&self, environment_id: &str) -> Vec<ReleaseTarget> {
        self.release_targets
            .filter(|t| t.environment_id == environment_id)
    }

    pub fn releases_for_target(&self, target: &ReleaseTarget) -> Vec<Release> {
        self.releases.get_by_group(&target.key())
    }

    /// Every job of every release of the target, newest first
    pub fn jobs_for_target(&self, target: &ReleaseTarget) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .releases_for_target(target)
            .iter()
            .flat_map(|release| self.jobs.get_by_group(&release.id))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        jobs
    }

    /// Jobs of the target still pending, in progress or awaiting action
    pub fn processing_jobs_for_target(&self, target: &ReleaseTarget) -> Vec<Job> {
        self.jobs_for_target(target)
            .into_iter()
            .filter(|j| j.status.is_processing())
            .collect()
    }

    /// Most recently created job of the target
    pub fn get_latest_job(&self, target: &ReleaseTarget) -> Option<Job> {
        self.jobs_for_target(target).into_iter().next()
    }

    /// Release of the latest successfully completed job
    ///
    /// `None` means the target has never been deployed; it is not an error.
    pub fn get_current_release(&self, target: &ReleaseTarget) -> Option<(Release, Job)> {
        self.jobs_for_target(target)
            .into_iter()
            .filter(|j| j.status.is_successful())
            .max_by(|a, b| {
                let a_done = a.completed_at.unwrap_or(a.updated_at);
                let b_done = b.completed_at.unwrap_or(b.updated_at);
                a_done.cmp(&b_done).then_with(|| a.created_at.cmp(&b.created_at))
            })
            .and_then(|job| self.releases.get(&job.release_id).map(|release| (release, job)))
    }
}

#[cfg(test)]
mod tests {
    use crate::context::MutationContext;
    use crate::store::Store;
    use chrono::{Duration, Utc};
    use keel_types::{DeploymentVersion, Job, JobStatus, Release, ReleaseTarget};
    use std::collections::BTreeMap;

    fn release(store: &Store, target: &ReleaseTarget, version_id: &str) -> Release {
        let version = DeploymentVersion::new(version_id, "d1", version_id, Utc::now());
        let release = Release::new(target.clone(), version, BTreeMap::new(), Utc::now());
        store
            .releases
            .upsert(&MutationContext::detached(), release.clone())
            .unwrap();
        release
    }

    fn job(store: &Store, id: &str, release: &Release, status: JobStatus, age_secs: i64) -> Job {
        let t = Utc::now() - Duration::seconds(age_secs);
        let mut job = Job::pending(id, &release.id, t);
        job.status = status;
        job.updated_at = t;
        if status.is_terminal() {
            job.completed_at = Some(t);
        }
        store.jobs.upsert(&MutationContext::detached(), job.clone()).unwrap();
        job
    }

    #[test]
    fn test_current_release_is_latest_success() {
        let store = Store::default();
        let target = ReleaseTarget::new("r1", "e1", "d1");
        assert!(store.get_current_release(&target).is_none());

        let r1 = release(&store, &target, "v1");
        let r2 = release(&store, &target, "v2");
        job(&store, "j1", &r1, JobStatus::Successful, 300);
        job(&store, "j2", &r2, JobStatus::Failure, 200);
        job(&store, "j3", &r2, JobStatus::Pending, 100);

        let (current, current_job) = store.get_current_release(&target).unwrap();
        assert_eq!(current.id, r1.id);
        assert_eq!(current_job.id, "j1");

        assert_eq!(store.get_latest_job(&target).unwrap().id, "j3");
        assert_eq!(store.processing_jobs_for_target(&target).len(), 1);
    }

    #[test]
    fn test_targets_are_isolated() {
        let store = Store::default();
        let a = ReleaseTarget::new("r1", "e1", "d1");
        let b = ReleaseTarget::new("r2", "e1", "d1");
        let ra = release(&store, &a, "v1");
        job(&store, "j1", &ra, JobStatus::Successful, 10);

        assert!(store.get_current_release(&b).is_none());
        assert!(store.get_latest_job(&b).is_none());
    }
}
