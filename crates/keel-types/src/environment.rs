//! Environments

use chrono::{DateTime, Utc};
use keel_selector::Selector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A logical grouping of resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub system_ids: Vec<String>,

    /// Resources in this environment; absent admits every resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_ids: Vec::new(),
            resource_selector: None,
            description: None,
            metadata: BTreeMap::new(),
            created_at,
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

    /// True when the environment shares at least one system with `system_ids`
    pub fn shares_system(&self, system_ids: &[String]) -> bool {
        self.system_ids.iter().any(|id| system_ids.contains(id))
    }
}
