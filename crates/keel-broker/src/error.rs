//! Error types for the broker

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("partition {partition} out of range for topic {topic}")]
    InvalidPartition { topic: String, partition: u32 },

    #[error("consumer is not subscribed to a topic")]
    NotSubscribed,

    /// Transport failure in a remote broker
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
