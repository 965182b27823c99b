//! Error types for entity validation

use crate::job::JobStatus;
use thiserror::Error;

/// Entity-level errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypesError {
    /// Entity payload is malformed
    #[error("validation failed: {0}")]
    Validation(String),

    /// Job status change not permitted by the state machine
    #[error("invalid job status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Merged job agent configuration does not describe a known integration
    #[error("invalid job agent config: {0}")]
    JobAgentConfig(String),
}

/// Result type for entity operations
pub type Result<T> = std::result::Result<T, TypesError>;
