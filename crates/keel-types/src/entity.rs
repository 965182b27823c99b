//! Entity kinds and compaction keys
//!
//! Every entity lives under `(kind, id)` in a compacted key-value log.
//! [`EntityRecord`] is the closed sum over all kinds, used wherever
//! heterogeneous entities travel together (change sets, persistence).

use crate::deployment::{Deployment, DeploymentVariable, DeploymentVersion, System};
use crate::environment::Environment;
use crate::job::{Job, JobAgent, JobVerification};
use crate::policy::{Policy, UserApprovalRecord};
use crate::release::{Release, ReleaseTarget};
use crate::resource::{Resource, ResourceProvider, ResourceVariable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Resource,
    ResourceProvider,
    ResourceVariable,
    System,
    Deployment,
    DeploymentVersion,
    DeploymentVariable,
    Environment,
    ReleaseTarget,
    Release,
    Job,
    JobAgent,
    JobVerification,
    Policy,
    UserApprovalRecord,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Resource => "resource",
            EntityKind::ResourceProvider => "resource-provider",
            EntityKind::ResourceVariable => "resource-variable",
            EntityKind::System => "system",
            EntityKind::Deployment => "deployment",
            EntityKind::DeploymentVersion => "deployment-version",
            EntityKind::DeploymentVariable => "deployment-variable",
            EntityKind::Environment => "environment",
            EntityKind::ReleaseTarget => "release-target",
            EntityKind::Release => "release",
            EntityKind::Job => "job",
            EntityKind::JobAgent => "job-agent",
            EntityKind::JobVerification => "job-verification",
            EntityKind::Policy => "policy",
            EntityKind::UserApprovalRecord => "user-approval-record",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entity lives in the compacted log
pub type CompactionKey = (EntityKind, String);

/// Anything stored by id
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Repository key; composite for some kinds
    fn entity_id(&self) -> String;

    fn compaction_key(&self) -> CompactionKey {
        (Self::KIND, self.entity_id())
    }

    fn into_record(self) -> EntityRecord;
}

macro_rules! impl_entity {
    ($ty:ident, |$this:ident| $id:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = EntityKind::$ty;

            fn entity_id(&self) -> String {
                let $this = self;
                $id
            }

            fn into_record(self) -> EntityRecord {
                EntityRecord::$ty(self)
            }
        }
    };
}

impl_entity!(Resource, |e| e.id.clone());
impl_entity!(ResourceProvider, |e| e.id.clone());
impl_entity!(ResourceVariable, |e| e.id());
impl_entity!(System, |e| e.id.clone());
impl_entity!(Deployment, |e| e.id.clone());
impl_entity!(DeploymentVersion, |e| e.id.clone());
impl_entity!(DeploymentVariable, |e| e.id.clone());
impl_entity!(Environment, |e| e.id.clone());
impl_entity!(ReleaseTarget, |e| e.key());
impl_entity!(Release, |e| e.id.clone());
impl_entity!(Job, |e| e.id.clone());
impl_entity!(JobAgent, |e| e.id.clone());
impl_entity!(JobVerification, |e| e.id.clone());
impl_entity!(Policy, |e| e.id.clone());
impl_entity!(UserApprovalRecord, |e| e.id());

/// Any entity, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "kebab-case")]
pub enum EntityRecord {
    Resource(Resource),
    ResourceProvider(ResourceProvider),
    ResourceVariable(ResourceVariable),
    System(System),
    Deployment(Deployment),
    DeploymentVersion(DeploymentVersion),
    DeploymentVariable(DeploymentVariable),
    Environment(Environment),
    ReleaseTarget(ReleaseTarget),
    Release(Release),
    Job(Job),
    JobAgent(JobAgent),
    JobVerification(JobVerification),
    Policy(Policy),
    UserApprovalRecord(UserApprovalRecord),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Resource(_) => EntityKind::Resource,
            EntityRecord::ResourceProvider(_) => EntityKind::ResourceProvider,
            EntityRecord::ResourceVariable(_) => EntityKind::ResourceVariable,
            EntityRecord::System(_) => EntityKind::System,
            EntityRecord::Deployment(_) => EntityKind::Deployment,
            EntityRecord::DeploymentVersion(_) => EntityKind::DeploymentVersion,
            EntityRecord::DeploymentVariable(_) => EntityKind::DeploymentVariable,
            EntityRecord::Environment(_) => EntityKind::Environment,
            EntityRecord::ReleaseTarget(_) => EntityKind::ReleaseTarget,
            EntityRecord::Release(_) => EntityKind::Release,
            EntityRecord::Job(_) => EntityKind::Job,
            EntityRecord::JobAgent(_) => EntityKind::JobAgent,
            EntityRecord::JobVerification(_) => EntityKind::JobVerification,
            EntityRecord::Policy(_) => EntityKind::Policy,
            EntityRecord::UserApprovalRecord(_) => EntityKind::UserApprovalRecord,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            EntityRecord::Resource(e) => e.entity_id(),
            EntityRecord::ResourceProvider(e) => e.entity_id(),
            EntityRecord::ResourceVariable(e) => e.entity_id(),
            EntityRecord::System(e) => e.entity_id(),
            EntityRecord::Deployment(e) => e.entity_id(),
            EntityRecord::DeploymentVersion(e) => e.entity_id(),
            EntityRecord::DeploymentVariable(e) => e.entity_id(),
            EntityRecord::Environment(e) => e.entity_id(),
            EntityRecord::ReleaseTarget(e) => e.entity_id(),
            EntityRecord::Release(e) => e.entity_id(),
            EntityRecord::Job(e) => e.entity_id(),
            EntityRecord::JobAgent(e) => e.entity_id(),
            EntityRecord::JobVerification(e) => e.entity_id(),
            EntityRecord::Policy(e) => e.entity_id(),
            EntityRecord::UserApprovalRecord(e) => e.entity_id(),
        }
    }

    pub fn compaction_key(&self) -> CompactionKey {
        (self.kind(), self.entity_id())
    }
}
