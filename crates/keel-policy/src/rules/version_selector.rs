//! Version selector rule

use crate::error::Result;
use crate::evaluation::RuleEvaluation;
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use keel_selector::Selector;
use keel_store::Store;
use std::sync::Arc;

const RULE_TYPE: &str = "version-selector";

/// Admits only versions matched by a selector
#[derive(Debug)]
pub struct VersionSelectorEvaluator {
    rule_id: String,
    selector: Selector,
    description: Option<String>,
    store: Arc<Store>,
}

impl VersionSelectorEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        selector: Selector,
        description: Option<String>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            selector,
            description,
            store,
        }
    }
}

#[async_trait]
impl RuleEvaluator for VersionSelectorEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION
    }

    fn rule_type(&self) -> &'static str {
        RULE_TYPE
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        2
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let version = scope.require_version(RULE_TYPE)?;
        let matched = self.store.selectors().matches(&self.selector, version)?;
        let description = self
            .description
            .clone()
            .unwrap_or_else(|| self.selector.to_string());
        if matched {
            Ok(RuleEvaluation::allowed(format!("Version {} matches selector", version.tag))
                .with_detail("selector", description))
        } else {
            Ok(RuleEvaluation::denied(format!(
                "Version {} does not match selector",
                version.tag
            ))
            .with_detail("selector", description))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{add_version, fixture};
    use serde_json::json;

    #[tokio::test]
    async fn test_matches_on_tag() {
        let fx = fixture();
        add_version(&fx.store, "2.0.0", "d1", fx.t0);
        let selector =
            Selector::Json(json!({"type": "version", "operator": "starts-with", "value": "2."}));
        let evaluator = VersionSelectorEvaluator::new("vs", selector, None, fx.store.clone());

        assert!(evaluator.evaluate(&fx.scope("2.0.0")).await.unwrap().allowed);
        assert!(evaluator.evaluate(&fx.scope("v1")).await.unwrap().is_hard_deny());
    }

    #[tokio::test]
    async fn test_selector_error_surfaces() {
        let fx = fixture();
        let evaluator =
            VersionSelectorEvaluator::new("vs", Selector::Cel("true".into()), None, fx.store.clone());
        assert!(evaluator.evaluate(&fx.scope("v1")).await.is_err());
    }
}
