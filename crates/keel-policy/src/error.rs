//! Error types for policy evaluation

use keel_selector::SelectorError;
use keel_store::StoreError;
use thiserror::Error;

/// Policy evaluation errors
///
/// Any of these aborts planning for the release target being evaluated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    /// Evaluator needs a scope field that was not provided
    #[error("rule {rule_type} requires scope field '{field}'")]
    MissingScope {
        rule_type: &'static str,
        field: &'static str,
    },

    /// Rule configuration cannot be evaluated
    #[error("invalid {rule_type} rule {rule_id}: {reason}")]
    InvalidRule {
        rule_type: &'static str,
        rule_id: String,
        reason: String,
    },

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;
