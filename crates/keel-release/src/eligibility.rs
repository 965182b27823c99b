//! Job eligibility
//!
//! System-level gate consulted after planning: even an admitted release
//! must not spawn a second job while one is running, nor keep failing
//! forever.

use crate::error::Result;
use keel_policy::{max_retries, DEFAULT_MAX_RETRIES};
use keel_store::Store;
use keel_types::{Job, Release};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Outcome of an eligibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum Eligibility {
    Eligible,

    /// A job for this release is running or already succeeded
    #[serde(rename_all = "camelCase")]
    AlreadyAttempted { job_id: String },

    /// The release failed `failures` times in a row
    #[serde(rename_all = "camelCase")]
    RetryLimitExceeded { failures: u32, max_retries: u32 },

    /// Another release's job is still processing on the target
    #[serde(rename_all = "camelCase")]
    JobInFlight { job_id: String },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Eligibility::Eligible => "eligible",
            Eligibility::AlreadyAttempted { .. } => "already attempted",
            Eligibility::RetryLimitExceeded { .. } => "retry limit exceeded",
            Eligibility::JobInFlight { .. } => "job in flight",
        }
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Decides whether a desired release should get a new job
#[derive(Debug, Clone)]
pub struct EligibilityChecker {
    store: Arc<Store>,
    default_max_retries: u32,
}

impl EligibilityChecker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry cap used when no retry rule applies to a target
    pub fn with_default_max_retries(mut self, max: u32) -> Self {
        self.default_max_retries = max;
        self
    }

    pub fn should_create_job(&self, release: &Release) -> Result<Eligibility> {
        let target = &release.release_target;

        let mut release_jobs = self.store.jobs.get_by_group(&release.id);
        release_jobs.sort_by(newest_first);

        if let Some(job) = release_jobs
            .iter()
            .find(|j| j.status.is_processing() || j.status.is_successful())
        {
            return Ok(self.decided(release, Eligibility::AlreadyAttempted {
                job_id: job.id.clone(),
            }));
        }

        let latest = self.store.get_latest_job(target);

        if latest.as_ref().is_some_and(|j| j.status.is_failed()) {
            let failures = release_jobs
                .iter()
                .take_while(|j| j.status.is_failed())
                .count() as u32;
            let cap = max_retries(
                &self.store.policies_for_target(target),
                self.default_max_retries,
            );
            if failures >= cap {
                return Ok(self.decided(release, Eligibility::RetryLimitExceeded {
                    failures,
                    max_retries: cap,
                }));
            }
        }

        if let Some(job) = latest.filter(|j| j.status.is_processing()) {
            return Ok(self.decided(release, Eligibility::JobInFlight { job_id: job.id }));
        }

        Ok(Eligibility::Eligible)
    }

    fn decided(&self, release: &Release, decision: Eligibility) -> Eligibility {
        debug!(
            release_id = %release.id,
            target_key = %release.target_key(),
            reason = decision.reason(),
            "Job not created"
        );
        decision
    }
}

fn newest_first(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}
