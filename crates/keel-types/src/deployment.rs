//! Systems, deployments, versions and deployment variables

use chrono::{DateTime, Utc};
use keel_selector::Selector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Grouping shared by deployments and environments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    pub id: String,

    #[serde(default)]
    pub workspace_id: String,

    pub name: String,

    #[serde(default)]
    pub slug: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A thing to be deployed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub system_ids: Vec<String>,

    /// Resources this deployment covers; absent admits every resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_agent_id: Option<String>,

    /// Overrides deep-merged over the job agent's own config
    #[serde(default)]
    pub job_agent_config: serde_json::Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            slug: name.clone(),
            name,
            system_ids: Vec::new(),
            resource_selector: None,
            job_agent_id: None,
            job_agent_config: serde_json::Map::new(),
            description: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_systems<I, S>(mut self, systems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_ids = systems.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.resource_selector = Some(selector);
        self
    }

    pub fn with_job_agent(mut self, job_agent_id: impl Into<String>) -> Self {
        self.job_agent_id = Some(job_agent_id.into());
        self
    }
}

/// Lifecycle status of a deployment version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentVersionStatus {
    Building,
    Ready,
    Failed,
    Rejected,
    /// Withheld from targets not already running it
    Paused,
    Unspecified,
}

impl Default for DeploymentVersionStatus {
    fn default() -> Self {
        DeploymentVersionStatus::Unspecified
    }
}

impl fmt::Display for DeploymentVersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentVersionStatus::Building => "building",
            DeploymentVersionStatus::Ready => "ready",
            DeploymentVersionStatus::Failed => "failed",
            DeploymentVersionStatus::Rejected => "rejected",
            DeploymentVersionStatus::Paused => "paused",
            DeploymentVersionStatus::Unspecified => "unspecified",
        };
        write!(f, "{}", s)
    }
}

/// A candidate release of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    pub id: String,

    pub deployment_id: String,

    pub tag: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub status: DeploymentVersionStatus,

    #[serde(default)]
    pub config: serde_json::Map<String, Value>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Version-specific variable overrides
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,
}

impl DeploymentVersion {
    pub fn new(
        id: impl Into<String>,
        deployment_id: impl Into<String>,
        tag: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let tag = tag.into();
        Self {
            id: id.into(),
            deployment_id: deployment_id.into(),
            name: tag.clone(),
            tag,
            status: DeploymentVersionStatus::Ready,
            config: serde_json::Map::new(),
            metadata: BTreeMap::new(),
            variables: BTreeMap::new(),
            created_at,
        }
    }

    pub fn with_status(mut self, status: DeploymentVersionStatus) -> Self {
        self.status = status;
        self
    }
}

/// A variable defined on a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariable {
    pub id: String,

    pub deployment_id: String,

    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(default)]
    pub values: Vec<DeploymentVariableValue>,
}

/// A selector-scoped value of a deployment variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariableValue {
    pub id: String,

    /// Resources this value applies to; absent applies to every resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,

    pub value: Value,

    /// Higher wins
    #[serde(default)]
    pub priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_status_wire_format() {
        let version: DeploymentVersion = serde_json::from_value(json!({
            "id": "v1",
            "deploymentId": "d1",
            "tag": "1.0.0",
            "status": "paused",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(version.status, DeploymentVersionStatus::Paused);
        assert!(version.variables.is_empty());
    }

    #[test]
    fn test_deployment_selector_round_trip() {
        let deployment = Deployment::new("d1", "api")
            .with_systems(["s1"])
            .with_selector(Selector::match_all());
        let doc = serde_json::to_value(&deployment).unwrap();
        assert_eq!(doc["systemIds"], json!(["s1"]));
        assert!(doc["resourceSelector"].get("json").is_some());

        let decoded: Deployment = serde_json::from_value(doc).unwrap();
        assert_eq!(decoded, deployment);
    }
}
