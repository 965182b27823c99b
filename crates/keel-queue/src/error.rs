//! Error types for the reconcile queue

use thiserror::Error;

/// Reconcile queue errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The caller no longer holds the lease on this item
    #[error("item {item_id} is not leased by worker {worker_id}")]
    NotOwned { item_id: i64, worker_id: String },

    /// Malformed enqueue or claim parameters
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend failure; retry with backoff
    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl QueueError {
    pub fn not_owned(item_id: i64, worker_id: impl Into<String>) -> Self {
        QueueError::NotOwned {
            item_id,
            worker_id: worker_id.into(),
        }
    }

    /// Whether the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Storage(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
