//! Release targets and releases
//!
//! A release is an immutable decision for one release target. Its id is a
//! content hash, so two plans that pick the same version with the same
//! resolved variables for the same target collapse to one record.

use crate::deployment::DeploymentVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// The derived `(deployment, environment, resource)` triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    pub resource_id: String,
    pub environment_id: String,
    pub deployment_id: String,
}

impl ReleaseTarget {
    pub fn new(
        resource_id: impl Into<String>,
        environment_id: impl Into<String>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            environment_id: environment_id.into(),
            deployment_id: deployment_id.into(),
        }
    }

    /// Composite key `resourceId-environmentId-deploymentId`
    pub fn key(&self) -> String {
        crate::ids::release_target_key(&self.resource_id, &self.environment_id, &self.deployment_id)
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A (release target, version, variables) decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: String,

    pub release_target: ReleaseTarget,

    pub version: DeploymentVersion,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Build a release whose id is derived from its content
    pub fn new(
        release_target: ReleaseTarget,
        version: DeploymentVersion,
        variables: BTreeMap<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = Self::content_id(&version, &variables, &release_target);
        Self {
            id,
            release_target,
            version,
            variables,
            created_at,
        }
    }

    /// SHA-256 over version id, tag, sorted variables and target key
    pub fn content_id(
        version: &DeploymentVersion,
        variables: &BTreeMap<String, Value>,
        release_target: &ReleaseTarget,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(version.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(version.tag.as_bytes());
        hasher.update([0u8]);
        for (key, value) in variables {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(release_target.key().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn target_key(&self) -> String {
        self.release_target.key()
    }
}
