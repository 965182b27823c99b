//! Change sets: per-request mutation buffers
//!
//! [`ChangeSet`] is an append-only log; [`DedupChangeSet`] keeps only the
//! latest change per key. Both are internally synchronized so any store
//! write may record into them. [`ChangeView`] is an immutable snapshot with
//! fluent combinators.

use crate::error::{Result, StoreError};
use keel_types::{CancelToken, EntityRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Upsert,
    Delete,
}

/// One recorded mutation
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub change_type: ChangeType,
    pub entity: T,
}

impl<T> Change<T> {
    pub fn upsert(entity: T) -> Self {
        Self {
            change_type: ChangeType::Upsert,
            entity,
        }
    }

    pub fn delete(entity: T) -> Self {
        Self {
            change_type: ChangeType::Delete,
            entity,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.change_type == ChangeType::Delete
    }
}

/// Dedup key of a changed entity
pub trait ChangeKey {
    fn change_key(&self) -> String;
}

impl ChangeKey for EntityRecord {
    fn change_key(&self) -> String {
        format!("{}/{}", self.kind(), self.entity_id())
    }
}

impl ChangeKey for String {
    fn change_key(&self) -> String {
        self.clone()
    }
}

/// Append-only change log
#[derive(Debug)]
pub struct ChangeSet<T> {
    records: Mutex<Vec<Change<T>>>,
}

impl<T> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> ChangeSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, change_type: ChangeType, entity: T) {
        self.records.lock().push(Change {
            change_type,
            entity,
        });
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of every recorded change, in order
    pub fn process(&self) -> ChangeView<T> {
        ChangeView::new(self.records.lock().clone())
    }
}

impl<T: Clone + ChangeKey> ChangeSet<T> {
    /// Collapse the log to the latest change per key
    pub fn dedup(&self) -> DedupChangeSet<T> {
        let dedup = DedupChangeSet::new();
        for change in self.records.lock().iter() {
            dedup.record(change.change_type, change.entity.clone());
        }
        dedup
    }
}

#[derive(Debug)]
struct DedupState<T> {
    order: Vec<String>,
    latest: HashMap<String, Change<T>>,
    finalized: Option<Arc<Vec<Change<T>>>>,
}

/// Change log keeping the last change per key
///
/// Keys keep the position of their first occurrence; the recorded change
/// is the most recent one.
#[derive(Debug)]
pub struct DedupChangeSet<T> {
    state: Mutex<DedupState<T>>,
}

impl<T> Default for DedupChangeSet<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(DedupState {
                order: Vec::new(),
                latest: HashMap::new(),
                finalized: None,
            }),
        }
    }
}

impl<T: Clone + ChangeKey> DedupChangeSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, change_type: ChangeType, entity: T) {
        let key = entity.change_key();
        let mut state = self.state.lock();
        state.finalized = None;
        if !state.latest.contains_key(&key) {
            state.order.push(key.clone());
        }
        state.latest.insert(
            key,
            Change {
                change_type,
                entity,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().order.is_empty()
    }

    /// Materialize the deduplicated changes; repeated calls reuse the result
    pub fn finalize(&self) -> Arc<Vec<Change<T>>> {
        let mut state = self.state.lock();
        if let Some(done) = &state.finalized {
            return done.clone();
        }
        let changes: Vec<Change<T>> = state
            .order
            .iter()
            .filter_map(|key| state.latest.get(key).cloned())
            .collect();
        let changes = Arc::new(changes);
        state.finalized = Some(changes.clone());
        changes
    }

    pub fn process(&self) -> ChangeView<T> {
        ChangeView::new(self.finalize().as_ref().clone())
    }
}

/// Immutable snapshot of changes with fluent combinators
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeView<T> {
    changes: Vec<Change<T>>,
}

impl<T: Clone> ChangeView<T> {
    pub fn new(changes: Vec<Change<T>>) -> Self {
        Self { changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change<T>> {
        self.changes.iter()
    }

    pub fn into_vec(self) -> Vec<Change<T>> {
        self.changes
    }

    pub fn filter<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&Change<T>) -> bool,
    {
        Self::new(
            self.changes
                .iter()
                .filter(|c| predicate(c))
                .cloned()
                .collect(),
        )
    }

    /// Transform each change's entity, keeping its change type
    pub fn map<U, F>(&self, mut f: F) -> ChangeView<U>
    where
        U: Clone,
        F: FnMut(&T) -> U,
    {
        ChangeView::new(
            self.changes
                .iter()
                .map(|c| Change {
                    change_type: c.change_type,
                    entity: f(&c.entity),
                })
                .collect(),
        )
    }

    /// Transform and drop changes mapped to `None`
    pub fn filter_map<U, F>(&self, mut f: F) -> ChangeView<U>
    where
        U: Clone,
        F: FnMut(&Change<T>) -> Option<U>,
    {
        ChangeView::new(
            self.changes
                .iter()
                .filter_map(|c| {
                    f(c).map(|entity| Change {
                        change_type: c.change_type,
                        entity,
                    })
                })
                .collect(),
        )
    }

    /// Group by key, groups ordered by first appearance
    pub fn group_by<K, F>(&self, mut key_fn: F) -> Vec<(K, ChangeView<T>)>
    where
        K: Eq + Hash + Clone,
        F: FnMut(&Change<T>) -> K,
    {
        let mut index: HashMap<K, usize> = HashMap::new();
        let mut groups: Vec<(K, Vec<Change<T>>)> = Vec::new();
        for change in &self.changes {
            let key = key_fn(change);
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(change.clone()),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![change.clone()]));
                }
            }
        }
        groups
            .into_iter()
            .map(|(key, changes)| (key, ChangeView::new(changes)))
            .collect()
    }

    /// Split into (matching, rest)
    pub fn partition<F>(&self, mut predicate: F) -> (Self, Self)
    where
        F: FnMut(&Change<T>) -> bool,
    {
        let (yes, no): (Vec<_>, Vec<_>) = self.changes.iter().cloned().partition(|c| predicate(c));
        (Self::new(yes), Self::new(no))
    }

    pub fn take(&self, n: usize) -> Self {
        Self::new(self.changes.iter().take(n).cloned().collect())
    }

    pub fn skip(&self, n: usize) -> Self {
        Self::new(self.changes.iter().skip(n).cloned().collect())
    }

    pub fn reduce<A, F>(&self, init: A, mut f: F) -> A
    where
        F: FnMut(A, &Change<T>) -> A,
    {
        self.changes.iter().fold(init, |acc, c| f(acc, c))
    }

    /// Visit each change, stopping early on cancellation or error
    pub fn for_each<F>(&self, cancel: &CancelToken, mut f: F) -> Result<()>
    where
        F: FnMut(&Change<T>) -> Result<()>,
    {
        for change in &self.changes {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            f(change)?;
        }
        Ok(())
    }
}
