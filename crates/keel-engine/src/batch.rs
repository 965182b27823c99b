//! Claim-check cache for large resource batches
//!
//! `resource-provider.set-resources` events carry only a batch id; the
//! resources themselves are published here first. A batch is consumed by
//! the first `take` and is gone after its TTL either way.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_types::{new_id, Clock, Resource, SharedClock};
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    resources: Vec<Resource>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BatchCache {
    entries: DashMap<String, Entry>,
    ttl: chrono::Duration,
    clock: SharedClock,
}

impl BatchCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            clock,
        }
    }

    /// Store a batch, returning the id to reference it by
    pub fn put(&self, resources: Vec<Resource>) -> String {
        let batch_id = new_id();
        let expires_at = self.clock.now() + self.ttl;
        debug!(batch_id = %batch_id, resources = resources.len(), "Batch stored");
        self.entries.insert(
            batch_id.clone(),
            Entry {
                resources,
                expires_at,
            },
        );
        batch_id
    }

    /// Remove and return a live batch; expired batches are misses
    pub fn take(&self, batch_id: &str) -> Option<Vec<Resource>> {
        let (_, entry) = self.entries.remove(batch_id)?;
        if entry.expires_at <= self.clock.now() {
            debug!(batch_id = %batch_id, "Batch expired");
            return None;
        }
        Some(entry.resources)
    }

    /// Drop every expired batch, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use keel_types::ManualClock;
    use std::sync::Arc;

    fn cache() -> (ManualClock, BatchCache) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap());
        let cache = BatchCache::new(Duration::from_secs(60), Arc::new(clock.clone()));
        (clock, cache)
    }

    #[test]
    fn test_take_is_one_time() {
        let (clock, cache) = cache();
        let id = cache.put(vec![Resource::new("r1", "node-1", clock.now())]);

        let batch = cache.take(&id).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(cache.take(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_batch_is_a_miss() {
        let (clock, cache) = cache();
        let id = cache.put(Vec::new());
        clock.advance(chrono::Duration::seconds(61));
        assert!(cache.take(&id).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let (clock, cache) = cache();
        cache.put(Vec::new());
        clock.advance(chrono::Duration::seconds(30));
        cache.put(Vec::new());
        clock.advance(chrono::Duration::seconds(31));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
