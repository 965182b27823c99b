//! Computed index: a keyed cache with a dirty set and a compute function
//!
//! Values are only (re)computed by [`ComputedIndex::recompute`]; reads never
//! compute. A key dirtied while its value is being computed stays dirty, so
//! the next recompute picks up the newer state.

use crate::error::{ReleaseError, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use keel_types::CancelToken;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Computes the value of one key
#[async_trait]
pub trait Compute<V>: Send + Sync {
    async fn compute(&self, key: &str) -> Result<V>;
}

pub struct ComputedIndex<V> {
    name: &'static str,
    registered: DashSet<String>,
    values: DashMap<String, V>,
    /// Dirty keys with the generation at which they were last dirtied
    dirty: DashMap<String, u64>,
    generation: AtomicU64,
    compute: Arc<dyn Compute<V>>,
    recompute_lock: Mutex<()>,
}

impl<V> fmt::Debug for ComputedIndex<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedIndex")
            .field("name", &self.name)
            .field("registered", &self.registered.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> ComputedIndex<V> {
    pub fn new(name: &'static str, compute: Arc<dyn Compute<V>>) -> Self {
        Self {
            name,
            registered: DashSet::new(),
            values: DashMap::new(),
            dirty: DashMap::new(),
            generation: AtomicU64::new(0),
            compute,
            recompute_lock: Mutex::new(()),
        }
    }

    /// Register `key` and mark it dirty
    pub fn add_entity(&self, key: &str) {
        self.registered.insert(key.to_string());
        self.mark(key);
    }

    pub fn remove_entity(&self, key: &str) {
        self.registered.remove(key);
        self.values.remove(key);
        self.dirty.remove(key);
    }

    /// Mark a registered key dirty; unknown keys are ignored
    pub fn dirty_entity(&self, key: &str) {
        if self.registered.contains(key) {
            self.mark(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.registered.contains(key)
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty.contains_key(key)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Last computed value; never computes
    pub fn get(&self, key: &str) -> Option<V> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Compute every dirty key, returning how many succeeded
    ///
    /// Failed keys stay dirty. Concurrent callers are serialized.
    pub async fn recompute(&self, cancel: &CancelToken) -> Result<usize> {
        let _guard = self.recompute_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(ReleaseError::Cancelled);
        }

        let batch: Vec<(String, u64)> = self
            .dirty
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let results = join_all(batch.iter().map(|(key, _)| self.compute.compute(key))).await;

        let mut computed = 0;
        for ((key, generation), result) in batch.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    if !self.registered.contains(&key) {
                        continue;
                    }
                    self.values.insert(key.clone(), value);
                    self.dirty.remove_if(&key, |_, g| *g == generation);
                    computed += 1;
                }
                Err(e) => {
                    warn!(index = self.name, key = %key, error = %e, "Recompute failed; key stays dirty");
                }
            }
        }
        debug!(index = self.name, computed, "Recomputed");
        Ok(computed)
    }

    fn mark(&self, key: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.dirty.insert(key.to_string(), generation);
    }
}
