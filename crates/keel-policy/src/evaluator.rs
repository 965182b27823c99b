//! Rule evaluator trait, memoization and rule execution

use crate::error::Result;
use crate::evaluation::{PolicyEvaluation, RuleEvaluation};
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// One rule kind's evaluation logic
#[async_trait]
pub trait RuleEvaluator: Send + Sync + fmt::Debug {
    /// Scope fields read by `evaluate`
    fn scope_fields(&self) -> ScopeFields;

    fn rule_type(&self) -> &'static str;

    fn rule_id(&self) -> &str;

    /// Relative cost; cheaper rules run first
    fn complexity(&self) -> u32;

    /// Whether a pending result lets the planner try older versions
    fn permits_fallback(&self) -> bool {
        false
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation>;
}

/// Caches an evaluator's results by the ids of the fields it reads
///
/// Lives for one planning call; errors are not cached.
pub struct Memoized {
    inner: Arc<dyn RuleEvaluator>,
    cache: Mutex<HashMap<String, RuleEvaluation>>,
}

impl fmt::Debug for Memoized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("inner", &self.inner)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl Memoized {
    pub fn new(inner: Arc<dyn RuleEvaluator>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn wrap(inner: Arc<dyn RuleEvaluator>) -> Arc<dyn RuleEvaluator> {
        Arc::new(Self::new(inner))
    }
}

#[async_trait]
impl RuleEvaluator for Memoized {
    fn scope_fields(&self) -> ScopeFields {
        self.inner.scope_fields()
    }

    fn rule_type(&self) -> &'static str {
        self.inner.rule_type()
    }

    fn rule_id(&self) -> &str {
        self.inner.rule_id()
    }

    fn complexity(&self) -> u32 {
        self.inner.complexity()
    }

    fn permits_fallback(&self) -> bool {
        self.inner.permits_fallback()
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let key = scope.key_for(self.inner.scope_fields());
        let cached = self.cache.lock().get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let result = self.inner.evaluate(scope).await?;
        self.cache.lock().insert(key, result.clone());
        Ok(result)
    }
}

/// Order evaluators cheapest first, keeping declaration order on ties
pub fn sort_by_complexity(evaluators: &mut [Arc<dyn RuleEvaluator>]) {
    evaluators.sort_by_key(|e| e.complexity());
}

/// Outcome of running a rule list against one scope
#[derive(Debug, Clone, Default)]
pub struct RuleRun {
    pub results: Vec<RuleEvaluation>,
    /// Every pending result came from a rule permitting fallback
    pub fallback_permitted: bool,
}

impl RuleRun {
    pub fn hard_denied(&self) -> bool {
        self.results.iter().any(RuleEvaluation::is_hard_deny)
    }

    pub fn pending(&self) -> bool {
        self.results.iter().any(|r| r.action_required)
    }
}

/// Run evaluators in order, skipping those whose scope fields are absent
/// and stopping at the first hard deny
pub async fn run_rules(evaluators: &[Arc<dyn RuleEvaluator>], scope: &Scope) -> Result<RuleRun> {
    let mut run = RuleRun {
        results: Vec::with_capacity(evaluators.len()),
        fallback_permitted: true,
    };
    for evaluator in evaluators {
        if !scope.has_fields(evaluator.scope_fields()) {
            trace!(rule_type = evaluator.rule_type(), "Scope lacks fields; rule skipped");
            continue;
        }
        let result = evaluator
            .evaluate(scope)
            .await?
            .for_rule(evaluator.rule_type(), evaluator.rule_id());
        if result.action_required && !evaluator.permits_fallback() {
            run.fallback_permitted = false;
        }
        let stop = result.is_hard_deny();
        run.results.push(result);
        if stop {
            break;
        }
    }
    Ok(run)
}

/// Evaluate one policy's rules into a [`PolicyEvaluation`]
pub async fn evaluate_policy(
    policy_id: &str,
    policy_name: &str,
    evaluators: &[Arc<dyn RuleEvaluator>],
    scope: &Scope,
) -> Result<PolicyEvaluation> {
    let run = run_rules(evaluators, scope).await?;
    let mut evaluation = PolicyEvaluation::new(policy_id, policy_name);
    for result in run.results {
        evaluation.add(result);
    }
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ActionType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counting {
        calls: AtomicUsize,
        fields: ScopeFields,
        outcome: RuleEvaluation,
        complexity: u32,
    }

    impl Counting {
        fn new(fields: ScopeFields, outcome: RuleEvaluation, complexity: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fields,
                outcome,
                complexity,
            })
        }
    }

    #[async_trait]
    impl RuleEvaluator for Counting {
        fn scope_fields(&self) -> ScopeFields {
            self.fields
        }
        fn rule_type(&self) -> &'static str {
            "counting"
        }
        fn rule_id(&self) -> &str {
            "c1"
        }
        fn complexity(&self) -> u32 {
            self.complexity
        }
        async fn evaluate(&self, _scope: &Scope) -> Result<RuleEvaluation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    fn version_scope(id: &str) -> Scope {
        Scope::new().with_version(Arc::new(keel_types::DeploymentVersion::new(
            id,
            "d1",
            id,
            chrono::Utc::now(),
        )))
    }

    #[tokio::test]
    async fn test_memoizer_keys_on_read_fields() {
        let inner = Counting::new(ScopeFields::VERSION, RuleEvaluation::allowed("ok"), 1);
        let memo = Memoized::wrap(inner.clone());

        memo.evaluate(&version_scope("v1")).await.unwrap();
        memo.evaluate(&version_scope("v1")).await.unwrap();
        memo.evaluate(&version_scope("v2")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_skips_missing_fields_and_stops_on_hard_deny() {
        let needs_env = Counting::new(ScopeFields::ENVIRONMENT, RuleEvaluation::denied("x"), 0);
        let deny = Counting::new(ScopeFields::VERSION, RuleEvaluation::denied("no"), 1);
        let after = Counting::new(ScopeFields::VERSION, RuleEvaluation::allowed("ok"), 2);
        let evaluators: Vec<Arc<dyn RuleEvaluator>> =
            vec![needs_env.clone(), deny.clone(), after.clone()];

        let run = run_rules(&evaluators, &version_scope("v1")).await.unwrap();
        assert_eq!(run.results.len(), 1);
        assert!(run.hard_denied());
        assert_eq!(run.results[0].rule_type, "counting");
        assert_eq!(needs_env.calls.load(Ordering::SeqCst), 0);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pending_without_fallback() {
        let pending = Counting::new(
            ScopeFields::VERSION,
            RuleEvaluation::pending(ActionType::Approval, "wait for it"),
            1,
        );
        let evaluators: Vec<Arc<dyn RuleEvaluator>> = vec![pending];
        let run = run_rules(&evaluators, &version_scope("v1")).await.unwrap();
        assert!(run.pending());
        assert!(!run.fallback_permitted);
    }

    #[test]
    fn test_sort_is_stable() {
        let a = Counting::new(ScopeFields::NONE, RuleEvaluation::allowed("a"), 2);
        let b = Counting::new(ScopeFields::NONE, RuleEvaluation::allowed("b"), 1);
        let c = Counting::new(ScopeFields::NONE, RuleEvaluation::allowed("c"), 2);
        let mut evaluators: Vec<Arc<dyn RuleEvaluator>> = vec![a, b, c];
        sort_by_complexity(&mut evaluators);
        let order: Vec<u32> = evaluators.iter().map(|e| e.complexity()).collect();
        assert_eq!(order, vec![1, 2, 2]);
    }
}
