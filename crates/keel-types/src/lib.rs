//! Keel Types - Core entity model for the deployment control plane
//!
//! Keel continuously decides, for every release target (a deployment,
//! environment and resource triple), which version should be deployed,
//! whether policy admits it, and dispatches a job to make it so.
//!
//! ## Key Concepts
//!
//! - **Resource**: a deployment target, owned by a resource provider
//! - **Deployment / Environment**: select resources and share systems
//! - **ReleaseTarget**: the derived triple, keyed `resourceId-environmentId-deploymentId`
//! - **DeploymentVersion**: a candidate release of a deployment
//! - **Release**: an immutable (target, version, variables) decision with a content-hash id
//! - **Job**: one execution of a release, driven through [`JobStatus`]
//! - **Policy**: rules gating which version a target may receive

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod cancel;
pub mod clock;
pub mod deployment;
pub mod entity;
pub mod environment;
pub mod error;
pub mod ids;
pub mod job;
pub mod policy;
pub mod release;
pub mod resource;

pub use cancel::{cancel_pair, CancelSource, CancelToken};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use deployment::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion,
    DeploymentVersionStatus, System,
};
pub use entity::{CompactionKey, Entity, EntityKind, EntityRecord};
pub use environment::Environment;
pub use error::{Result, TypesError};
pub use ids::new_id;
pub use job::{
    deep_merge, Job, JobAgent, JobAgentConfig, JobStatus, JobVerification, VerificationStatus,
};
pub use policy::{
    ApprovalStatus, Policy, PolicyRule, PolicyTargetSelector, RolloutSchedule, RuleKind,
    TimeWindow, UserApprovalRecord,
};
pub use release::{Release, ReleaseTarget};
pub use resource::{Resource, ResourceProvider, ResourceVariable};
