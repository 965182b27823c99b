//! Keel Release - deciding and driving what each release target runs
//!
//! The pipeline for one release target:
//!
//! 1. [`Planner`] walks the deployment's versions newest first through the
//!    global and policy rules and resolves the release variables.
//! 2. [`EligibilityChecker`] refuses duplicate, in-flight or exhausted jobs.
//! 3. [`Executor`] persists the release, creates the job and dispatches it.
//!
//! [`Orchestrator`] glues the three together. [`StateIndex`] caches desired,
//! current and latest-job state per target, and [`ReleaseManager`] turns a
//! change set into index invalidations and reconciliations.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod eligibility;
pub mod error;
pub mod executor;
pub mod index;
pub mod manager;
pub mod orchestrator;
pub mod planner;
pub mod state;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;

pub use eligibility::{Eligibility, EligibilityChecker};
pub use error::{ReleaseError, Result};
pub use executor::{Dispatcher, Executor};
pub use index::{Compute, ComputedIndex};
pub use manager::{ProcessReport, ReevaluationScheduler, ReleaseManager};
pub use orchestrator::{Orchestrator, Reconciliation};
pub use planner::{DesiredRelease, Planner, TargetEntities, TargetEvaluation};
pub use state::{JobWithVerifications, StateIndex, TargetState};
pub use variables::resolve_variables;
