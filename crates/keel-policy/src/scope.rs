//! Evaluation scope
//!
//! A scope carries optional handles to the entities a rule may read. Each
//! evaluator declares the fields it needs via [`ScopeFields`]; evaluators
//! whose fields are absent are skipped.

use crate::error::{PolicyError, Result};
use keel_types::{Deployment, DeploymentVersion, Environment, ReleaseTarget, Resource};
use std::ops::BitOr;
use std::sync::Arc;

/// Bitmask over scope fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeFields(u8);

impl ScopeFields {
    pub const NONE: ScopeFields = ScopeFields(0);
    pub const VERSION: ScopeFields = ScopeFields(1);
    pub const ENVIRONMENT: ScopeFields = ScopeFields(1 << 1);
    pub const RESOURCE: ScopeFields = ScopeFields(1 << 2);
    pub const DEPLOYMENT: ScopeFields = ScopeFields(1 << 3);
    pub const RELEASE_TARGET: ScopeFields = ScopeFields(1 << 4);

    pub fn contains(self, other: ScopeFields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ScopeFields {
    type Output = ScopeFields;

    fn bitor(self, rhs: ScopeFields) -> ScopeFields {
        ScopeFields(self.0 | rhs.0)
    }
}

/// Entities visible to rule evaluators
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub version: Option<Arc<DeploymentVersion>>,
    pub environment: Option<Arc<Environment>>,
    pub resource: Option<Arc<Resource>>,
    pub deployment: Option<Arc<Deployment>>,
    pub release_target: Option<Arc<ReleaseTarget>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: Arc<DeploymentVersion>) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_environment(mut self, environment: Arc<Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_resource(mut self, resource: Arc<Resource>) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_deployment(mut self, deployment: Arc<Deployment>) -> Self {
        self.deployment = Some(deployment);
        self
    }

    pub fn with_release_target(mut self, target: Arc<ReleaseTarget>) -> Self {
        self.release_target = Some(target);
        self
    }

    /// Fields present in this scope
    pub fn fields(&self) -> ScopeFields {
        let mut fields = ScopeFields::NONE;
        if self.version.is_some() {
            fields = fields | ScopeFields::VERSION;
        }
        if self.environment.is_some() {
            fields = fields | ScopeFields::ENVIRONMENT;
        }
        if self.resource.is_some() {
            fields = fields | ScopeFields::RESOURCE;
        }
        if self.deployment.is_some() {
            fields = fields | ScopeFields::DEPLOYMENT;
        }
        if self.release_target.is_some() {
            fields = fields | ScopeFields::RELEASE_TARGET;
        }
        fields
    }

    pub fn has_fields(&self, required: ScopeFields) -> bool {
        self.fields().contains(required)
    }

    /// Cache key over the ids of the requested fields
    pub fn key_for(&self, fields: ScopeFields) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(5);
        if fields.contains(ScopeFields::VERSION) {
            parts.push(format!("v:{}", self.version.as_ref().map_or("", |v| v.id.as_str())));
        }
        if fields.contains(ScopeFields::ENVIRONMENT) {
            parts.push(format!("e:{}", self.environment.as_ref().map_or("", |e| e.id.as_str())));
        }
        if fields.contains(ScopeFields::RESOURCE) {
            parts.push(format!("r:{}", self.resource.as_ref().map_or("", |r| r.id.as_str())));
        }
        if fields.contains(ScopeFields::DEPLOYMENT) {
            parts.push(format!("d:{}", self.deployment.as_ref().map_or("", |d| d.id.as_str())));
        }
        if fields.contains(ScopeFields::RELEASE_TARGET) {
            parts.push(format!(
                "t:{}",
                self.release_target.as_ref().map_or(String::new(), |t| t.key())
            ));
        }
        parts.join("|")
    }

    pub fn require_version(&self, rule_type: &'static str) -> Result<&DeploymentVersion> {
        self.version.as_deref().ok_or(PolicyError::MissingScope {
            rule_type,
            field: "version",
        })
    }

    pub fn require_environment(&self, rule_type: &'static str) -> Result<&Environment> {
        self.environment.as_deref().ok_or(PolicyError::MissingScope {
            rule_type,
            field: "environment",
        })
    }

    pub fn require_resource(&self, rule_type: &'static str) -> Result<&Resource> {
        self.resource.as_deref().ok_or(PolicyError::MissingScope {
            rule_type,
            field: "resource",
        })
    }

    pub fn require_deployment(&self, rule_type: &'static str) -> Result<&Deployment> {
        self.deployment.as_deref().ok_or(PolicyError::MissingScope {
            rule_type,
            field: "deployment",
        })
    }

    pub fn require_release_target(&self, rule_type: &'static str) -> Result<&ReleaseTarget> {
        self.release_target.as_deref().ok_or(PolicyError::MissingScope {
            rule_type,
            field: "releaseTarget",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_field_guard() {
        let scope = Scope::new()
            .with_version(Arc::new(DeploymentVersion::new("v1", "d1", "1.0", Utc::now())))
            .with_release_target(Arc::new(ReleaseTarget::new("r1", "e1", "d1")));
        assert!(scope.has_fields(ScopeFields::VERSION));
        assert!(scope.has_fields(ScopeFields::VERSION | ScopeFields::RELEASE_TARGET));
        assert!(!scope.has_fields(ScopeFields::VERSION | ScopeFields::ENVIRONMENT));
        assert!(scope.has_fields(ScopeFields::NONE));
    }

    #[test]
    fn test_key_uses_only_requested_fields() {
        let scope = Scope::new()
            .with_version(Arc::new(DeploymentVersion::new("v1", "d1", "1.0", Utc::now())))
            .with_release_target(Arc::new(ReleaseTarget::new("r1", "e1", "d1")));
        assert_eq!(scope.key_for(ScopeFields::VERSION), "v:v1");
        assert_eq!(
            scope.key_for(ScopeFields::VERSION | ScopeFields::RELEASE_TARGET),
            "v:v1|t:r1-e1-d1"
        );
    }
}
