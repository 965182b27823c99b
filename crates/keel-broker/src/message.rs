//! Broker messages and the producer / consumer contracts

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A record read from a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Where a published record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
}

/// Publishes keyed records to one topic
///
/// Records with the same key land in the same partition and keep their
/// relative order.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, key: &[u8], value: &[u8]) -> Result<Delivery>;

    /// Wait for buffered records to be durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Reads a topic as a member of a consumer group
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Next record, or `None` once `timeout` elapses with nothing to read
    async fn read_message(&self, timeout: Duration) -> Result<Option<Message>>;

    /// Record `message` as processed for the group
    async fn commit(&self, message: &Message) -> Result<()>;

    /// Offset the group resumes from on `partition`, if any was committed
    async fn committed_offset(&self, partition: u32) -> Result<Option<u64>>;

    /// Make `offset` the next offset the group reads on `partition`
    async fn seek(&self, partition: u32, offset: u64) -> Result<()>;
}

/// FNV-1a partitioner; empty keys go to partition 0
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    if key.is_empty() || partitions <= 1 {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % u64::from(partitions)) as u32
}
