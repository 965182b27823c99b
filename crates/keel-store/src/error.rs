//! Error types for the store

use keel_selector::SelectorError;
use keel_types::{EntityKind, TypesError};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Entity failed validation on write
    #[error("validation failed: {0}")]
    Validation(String),

    /// Required entity is absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Iteration stopped by cancellation
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
