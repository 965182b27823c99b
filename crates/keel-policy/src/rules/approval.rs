//! Any-approval rule

use crate::error::Result;
use crate::evaluation::{ActionType, RuleEvaluation};
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use keel_store::Store;
use keel_types::ApprovalStatus;
use std::collections::BTreeSet;
use std::sync::Arc;

const RULE_TYPE: &str = "any-approval";

/// Requires at least `min_approvals` distinct approvers for (version, environment)
#[derive(Debug)]
pub struct AnyApprovalEvaluator {
    rule_id: String,
    min_approvals: u32,
    store: Arc<Store>,
}

impl AnyApprovalEvaluator {
    pub fn new(rule_id: impl Into<String>, min_approvals: u32, store: Arc<Store>) -> Self {
        Self {
            rule_id: rule_id.into(),
            min_approvals,
            store,
        }
    }
}

#[async_trait]
impl RuleEvaluator for AnyApprovalEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::ENVIRONMENT
    }

    fn rule_type(&self) -> &'static str {
        RULE_TYPE
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        3
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let version = scope.require_version(RULE_TYPE)?;
        let environment = scope.require_environment(RULE_TYPE)?;

        let records = self.store.user_approval_records.filter(|r| {
            r.version_id == version.id && r.environment_id == environment.id
        });

        if let Some(rejection) = records.iter().find(|r| r.status == ApprovalStatus::Rejected) {
            return Ok(RuleEvaluation::denied(format!(
                "Version {} was rejected by {}",
                version.tag, rejection.user_id
            ))
            .with_detail("rejectedBy", rejection.user_id.clone()));
        }

        let approvers: BTreeSet<String> = records
            .into_iter()
            .filter(|r| r.status == ApprovalStatus::Approved)
            .map(|r| r.user_id)
            .collect();
        let count = approvers.len() as u32;
        let approvers: Vec<String> = approvers.into_iter().collect();

        if count >= self.min_approvals {
            return Ok(RuleEvaluation::allowed(format!(
                "Version {} has {} of {} required approvals",
                version.tag, count, self.min_approvals
            ))
            .with_detail("approvers", approvers)
            .with_detail("minApprovals", self.min_approvals));
        }

        Ok(RuleEvaluation::pending(
            ActionType::Approval,
            format!(
                "Version {} requires {} approvals, has {}",
                version.tag, self.min_approvals, count
            ),
        )
        .with_detail("approvers", approvers)
        .with_detail("minApprovals", self.min_approvals))
    }
}
