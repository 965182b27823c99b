//! Deployment orchestrator: plan, check eligibility, execute

use crate::eligibility::{Eligibility, EligibilityChecker};
use crate::error::Result;
use crate::executor::Executor;
use crate::planner::{DesiredRelease, Planner, TargetEntities};
use keel_store::MutationContext;
use keel_types::{Job, ReleaseTarget};
use tracing::{debug, info_span, instrument, Instrument};

/// Result of one reconciliation pass for a target
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub desired: Option<DesiredRelease>,
    pub job: Option<Job>,
    /// Set when eligibility declined to create a job
    pub skipped: Option<Eligibility>,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    planner: Planner,
    eligibility: EligibilityChecker,
    executor: Executor,
}

impl Orchestrator {
    pub fn new(planner: Planner, eligibility: EligibilityChecker, executor: Executor) -> Self {
        Self {
            planner,
            eligibility,
            executor,
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Drive `target` toward its desired release
    ///
    /// `force` bypasses the eligibility check but never policy. A phase
    /// failure aborts the pass; the next pass starts over.
    #[instrument(skip(self, ctx, entities), fields(target_key = %target.key()))]
    pub async fn reconcile(
        &self,
        ctx: &MutationContext,
        target: &ReleaseTarget,
        force: bool,
        entities: Option<&TargetEntities>,
    ) -> Result<Reconciliation> {
        let desired = self
            .planner
            .plan(target, entities)
            .instrument(info_span!("plan"))
            .await?;

        let Some(desired) = desired else {
            debug!("No deployable version");
            return Ok(Reconciliation::default());
        };

        if !desired.can_deploy {
            debug!(
                version_id = %desired.release.version.id,
                pending = desired.pending_actions.len(),
                "Desired release awaiting action"
            );
            return Ok(Reconciliation {
                desired: Some(desired),
                ..Default::default()
            });
        }

        if !force {
            let decision = info_span!("eligibility")
                .in_scope(|| self.eligibility.should_create_job(&desired.release))?;
            if !decision.is_eligible() {
                return Ok(Reconciliation {
                    desired: Some(desired),
                    job: None,
                    skipped: Some(decision),
                });
            }
        }

        let job = self
            .executor
            .execute(ctx, &desired.release)
            .instrument(info_span!("execute"))
            .await?;

        Ok(Reconciliation {
            desired: Some(desired),
            job: Some(job),
            skipped: None,
        })
    }
}
