//! Error types for selector parsing and evaluation

use thiserror::Error;

/// Selector errors
///
/// Every variant is a validation failure: the selector (or the entity it is
/// applied to) is malformed and retrying will not help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// Condition `type` is not recognised
    #[error("unknown condition type: {0}")]
    UnknownCondition(String),

    /// Operator is not valid for the condition type
    #[error("unknown operator '{operator}' for condition type '{condition}'")]
    UnknownOperator { condition: String, operator: String },

    /// A required property is missing or has the wrong JSON type
    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    /// Comparison nesting exceeds the supported depth
    #[error("selector nesting depth {depth} exceeds maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    /// Entity field has a different type than the condition expects
    #[error("type mismatch on field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Date value could not be parsed as RFC3339
    #[error("malformed date '{value}': {reason}")]
    MalformedDate { value: String, reason: String },

    /// Entity metadata is not a string map
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// Entity could not be projected into a selectable document
    #[error("entity serialization failed: {0}")]
    Serialization(String),

    /// CEL selector used without a configured CEL engine
    #[error("no CEL engine configured to evaluate expression: {0}")]
    CelUnavailable(String),

    /// CEL engine rejected the expression
    #[error("CEL error: {0}")]
    Cel(String),
}

/// Result type for selector operations
pub type Result<T> = std::result::Result<T, SelectorError>;
