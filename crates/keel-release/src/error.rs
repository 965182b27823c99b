//! Error types for release planning and reconciliation

use keel_policy::PolicyError;
use keel_selector::SelectorError;
use keel_store::StoreError;
use keel_types::{EntityKind, TypesError};
use serde_json::Value;
use thiserror::Error;

/// Release errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReleaseError {
    /// Required entity is absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Two selector-matched variable values tie on priority with different contents
    #[error("conflicting values for variable '{key}' at priority {priority}: {first} vs {second}")]
    VariableConflict {
        key: String,
        priority: i64,
        first: Value,
        second: Value,
    },

    /// Integration dispatch failed
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Re-evaluation could not be scheduled
    #[error("scheduling failed: {0}")]
    Scheduling(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl ReleaseError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        ReleaseError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the failure is caused by malformed input rather than state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ReleaseError::VariableConflict { .. }
                | ReleaseError::Selector(_)
                | ReleaseError::Policy(PolicyError::InvalidRule { .. })
                | ReleaseError::Policy(PolicyError::Selector(_))
        )
    }
}

/// Result type for release operations
pub type Result<T> = std::result::Result<T, ReleaseError>;
