//! Keel Policy - rule evaluation for release targets
//!
//! Policies apply to release targets through target selectors and carry
//! rules. Each rule kind has a [`RuleEvaluator`] that reads a [`Scope`] and
//! produces a [`RuleEvaluation`]: allowed, hard denied, or pending an
//! approval or a wait.
//!
//! Evaluators are ordered by complexity, skipped when their scope fields are
//! absent, and memoized per planning call via [`Memoized`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod evaluation;
pub mod evaluator;
pub mod rules;
pub mod scope;

pub use error::{PolicyError, Result};
pub use evaluation::{ActionType, PolicyEvaluation, RuleEvaluation};
pub use evaluator::{evaluate_policy, run_rules, sort_by_complexity, Memoized, RuleEvaluator, RuleRun};
pub use rules::{max_retries, EvaluatorFactory, DEFAULT_MAX_RETRIES, GLOBAL_RULE_ID};
pub use scope::{Scope, ScopeFields};
