//! Release variable resolution
//!
//! Layers, lowest precedence first:
//!
//! 1. deployment variable `defaultValue`
//! 2. highest-priority deployment variable value whose resource selector
//!    admits the resource
//! 3. version-specific override from `DeploymentVersion.variables`
//! 4. resource variable

use crate::error::{ReleaseError, Result};
use keel_store::Store;
use keel_types::{DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Resource};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

/// Resolve the variable map for `version` deployed onto `resource`
pub fn resolve_variables(
    store: &Store,
    version: &DeploymentVersion,
    resource: &Resource,
) -> Result<BTreeMap<String, Value>> {
    let mut resolved = BTreeMap::new();

    for variable in store.variables_for_deployment(&version.deployment_id) {
        if let Some(value) = deployment_value(store, &variable, resource)? {
            resolved.insert(variable.key.clone(), value);
        }
    }

    for (key, value) in &version.variables {
        resolved.insert(key.clone(), value.clone());
    }

    for variable in store.variables_for_resource(&resource.id) {
        resolved.insert(variable.key, variable.value);
    }

    trace!(version_id = %version.id, resource_id = %resource.id, count = resolved.len(), "Resolved variables");
    Ok(resolved)
}

/// Selector-matched value with the highest priority, else the default
fn deployment_value(
    store: &Store,
    variable: &DeploymentVariable,
    resource: &Resource,
) -> Result<Option<Value>> {
    let mut matched: Vec<&DeploymentVariableValue> = Vec::new();
    for candidate in &variable.values {
        if store
            .selectors()
            .matches_optional(candidate.resource_selector.as_ref(), resource)?
        {
            matched.push(candidate);
        }
    }

    let Some(top) = matched.iter().map(|v| v.priority).max() else {
        return Ok(variable.default_value.clone());
    };
    let mut winners = matched.into_iter().filter(|v| v.priority == top);
    let Some(first) = winners.next() else {
        return Ok(variable.default_value.clone());
    };
    if let Some(other) = winners.find(|v| v.value != first.value) {
        return Err(ReleaseError::VariableConflict {
            key: variable.key.clone(),
            priority: top,
            first: first.value.clone(),
            second: other.value.clone(),
        });
    }
    Ok(Some(first.value.clone()))
}
