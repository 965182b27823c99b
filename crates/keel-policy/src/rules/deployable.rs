//! Global version gates: deployable status and paused versions

use crate::error::Result;
use crate::evaluation::RuleEvaluation;
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use keel_store::Store;
use keel_types::DeploymentVersionStatus;
use std::sync::Arc;

/// Denies versions that are not ready
///
/// Paused versions pass here and are judged by [`PausedVersionsEvaluator`].
#[derive(Debug)]
pub struct DeployableVersionsEvaluator {
    rule_id: String,
}

impl DeployableVersionsEvaluator {
    pub fn new(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
        }
    }
}

#[async_trait]
impl RuleEvaluator for DeployableVersionsEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION
    }

    fn rule_type(&self) -> &'static str {
        "deployable-versions"
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        0
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let version = scope.require_version(self.rule_type())?;
        match version.status {
            DeploymentVersionStatus::Ready | DeploymentVersionStatus::Paused => {
                Ok(RuleEvaluation::allowed(format!("Version {} is deployable", version.tag)))
            }
            status => Ok(RuleEvaluation::denied(format!(
                "Version {} is {}",
                version.tag, status
            ))
            .with_detail("status", status.to_string())),
        }
    }
}

/// Denies paused versions except on targets already running them
#[derive(Debug)]
pub struct PausedVersionsEvaluator {
    rule_id: String,
    store: Arc<Store>,
}

impl PausedVersionsEvaluator {
    pub fn new(rule_id: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            rule_id: rule_id.into(),
            store,
        }
    }
}

#[async_trait]
impl RuleEvaluator for PausedVersionsEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::RELEASE_TARGET
    }

    fn rule_type(&self) -> &'static str {
        "paused-versions"
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        1
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let version = scope.require_version(self.rule_type())?;
        if version.status != DeploymentVersionStatus::Paused {
            return Ok(RuleEvaluation::allowed("Version is not paused"));
        }
        let target = scope.require_release_target(self.rule_type())?;
        let running = self
            .store
            .get_current_release(target)
            .is_some_and(|(release, _)| release.version.id == version.id);
        if running {
            Ok(RuleEvaluation::allowed(format!(
                "Version {} is paused but already deployed to this target",
                version.tag
            )))
        } else {
            Ok(RuleEvaluation::denied(format!("Version {} is paused", version.tag)))
        }
    }
}
