//! In-process partitioned broker
//!
//! Each topic is a fixed list of append-only partition logs. Consumers in
//! the same group share one cursor per partition, handed out under a lock,
//! so no two members read the same offset. Separate groups have separate
//! cursors and each sees every record.

use crate::error::{BrokerError, Result};
use crate::message::{partition_for, Consumer, Delivery, Message, Producer};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Topic {
    name: String,
    partitions: Vec<RwLock<Vec<Message>>>,
}

impl Topic {
    fn partition(&self, partition: u32) -> Result<&RwLock<Vec<Message>>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| BrokerError::InvalidPartition {
                topic: self.name.clone(),
                partition,
            })
    }
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next offset to hand out, per partition
    next: HashMap<u32, u64>,
    /// Next offset to resume from after a restart, per partition
    committed: HashMap<u32, u64>,
}

/// Broker holding every topic in memory
#[derive(Debug, Default)]
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    groups: Mutex<HashMap<(String, String), Arc<Mutex<GroupState>>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create `topic` with `partitions` partitions; existing topics are kept
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut topics = self.topics.write();
        topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, partitions, "Created topic");
            Arc::new(Topic {
                name: topic.to_string(),
                partitions: (0..partitions.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
            })
        });
    }

    pub fn partition_count(&self, topic: &str) -> Result<u32> {
        Ok(self.topic(topic)?.partitions.len() as u32)
    }

    /// Number of records in one partition
    pub fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64> {
        Ok(self.topic(topic)?.partition(partition)?.read().len() as u64)
    }

    pub fn producer(self: &Arc<Self>, topic: &str) -> Result<MemoryProducer> {
        let topic = self.topic(topic)?;
        Ok(MemoryProducer { topic })
    }

    pub fn consumer(self: &Arc<Self>, topic: &str, group_id: &str) -> Result<MemoryConsumer> {
        let topic = self.topic(topic)?;
        let group = self
            .groups
            .lock()
            .entry((group_id.to_string(), topic.name.clone()))
            .or_default()
            .clone();
        Ok(MemoryConsumer {
            topic,
            group,
            cursor: AtomicUsize::new(0),
        })
    }

    fn topic(&self, topic: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }
}

/// Producer bound to one topic of a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryProducer {
    topic: Arc<Topic>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(&self, key: &[u8], value: &[u8]) -> Result<Delivery> {
        let partition = partition_for(key, self.topic.partitions.len() as u32);
        let mut log = self.topic.partition(partition)?.write();
        let offset = log.len() as u64;
        log.push(Message {
            topic: self.topic.name.clone(),
            partition,
            offset,
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp: Utc::now(),
        });
        trace!(topic = %self.topic.name, partition, offset, "Published");
        Ok(Delivery { partition, offset })
    }
}

/// Group member reading every partition of one topic
#[derive(Debug)]
pub struct MemoryConsumer {
    topic: Arc<Topic>,
    group: Arc<Mutex<GroupState>>,
    /// Round-robin start partition for the next read
    cursor: AtomicUsize,
}

impl MemoryConsumer {
    /// Take the next unread record for the group without waiting
    pub fn try_read(&self) -> Option<Message> {
        let count = self.topic.partitions.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut group = self.group.lock();
        for step in 0..count {
            let partition = ((start + step) % count) as u32;
            let next = group
                .next
                .get(&partition)
                .or_else(|| group.committed.get(&partition))
                .copied()
                .unwrap_or(0);
            let log = self.topic.partitions[partition as usize].read();
            if let Some(message) = log.get(next as usize) {
                group.next.insert(partition, next + 1);
                return Some(message.clone());
            }
        }
        None
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn read_message(&self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_read() {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn commit(&self, message: &Message) -> Result<()> {
        self.topic.partition(message.partition)?;
        let mut group = self.group.lock();
        let entry = group.committed.entry(message.partition).or_insert(0);
        *entry = (*entry).max(message.offset + 1);
        Ok(())
    }

    async fn committed_offset(&self, partition: u32) -> Result<Option<u64>> {
        self.topic.partition(partition)?;
        Ok(self.group.lock().committed.get(&partition).copied())
    }

    async fn seek(&self, partition: u32, offset: u64) -> Result<()> {
        self.topic.partition(partition)?;
        self.group.lock().next.insert(partition, offset);
        debug!(topic = %self.topic.name, partition, offset, "Seeked");
        Ok(())
    }
}
