//! Error types for the engine

use keel_broker::BrokerError;
use keel_policy::PolicyError;
use keel_queue::QueueError;
use keel_release::ReleaseError;
use keel_store::StoreError;
use keel_types::{EntityKind, TypesError};
use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Event or entity failed validation; never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// Event references an entity that does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Claim-check batch missing or expired; retried until it shows up
    #[error("resource batch {0} not found or expired")]
    BatchMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether handling the same event again may succeed
    ///
    /// Retriable failures leave the broker offset uncommitted.
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::BatchMissing(_) => true,
            EngineError::Queue(e) => e.is_transient(),
            EngineError::Broker(BrokerError::Transport(_)) => true,
            EngineError::Release(ReleaseError::Cancelled) => true,
            EngineError::Store(StoreError::Cancelled) => true,
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(EngineError::BatchMissing("b1".into()).is_retriable());
        assert!(EngineError::Queue(QueueError::Storage("down".into())).is_retriable());
        assert!(EngineError::Release(ReleaseError::Cancelled).is_retriable());

        assert!(!EngineError::Validation("bad".into()).is_retriable());
        assert!(!EngineError::not_found(EntityKind::Job, "j1").is_retriable());
        assert!(!EngineError::Queue(QueueError::Validation("bad".into())).is_retriable());
    }
}
