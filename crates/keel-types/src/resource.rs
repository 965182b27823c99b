//! Resources, their providers, and resource-scoped variables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A deployment target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,

    #[serde(default)]
    pub workspace_id: String,

    pub name: String,

    /// External unique key, stable across provider syncs
    pub identifier: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub config: serde_json::Map<String, Value>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Owning resource provider, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(id: impl Into<String>, identifier: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let identifier = identifier.into();
        Self {
            id: id.into(),
            workspace_id: String::new(),
            name: identifier.clone(),
            identifier,
            kind: String::new(),
            version: String::new(),
            config: serde_json::Map::new(),
            metadata: BTreeMap::new(),
            provider_id: None,
            created_at,
            updated_at: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Owner of a set of resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProvider {
    pub id: String,

    #[serde(default)]
    pub workspace_id: String,

    pub name: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
}

/// A variable pinned to one resource; overrides every deployment layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVariable {
    pub resource_id: String,
    pub key: String,
    pub value: Value,
}

impl ResourceVariable {
    /// Composite id `resourceId-key`
    pub fn id(&self) -> String {
        crate::ids::resource_variable_id(&self.resource_id, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_document_is_camel_case() {
        let resource = Resource::new("r1", "prod-cluster", Utc::now()).with_metadata("env", "prod");
        let doc = serde_json::to_value(&resource).unwrap();
        assert_eq!(doc["identifier"], json!("prod-cluster"));
        assert_eq!(doc["metadata"]["env"], json!("prod"));
        assert!(doc.get("createdAt").is_some());
        assert!(doc.get("providerId").is_none());
    }

    #[test]
    fn test_resource_defaults_on_decode() {
        let resource: Resource = serde_json::from_value(json!({
            "id": "r1",
            "name": "api",
            "identifier": "api",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(resource.metadata.is_empty());
        assert!(resource.provider_id.is_none());
    }
}
