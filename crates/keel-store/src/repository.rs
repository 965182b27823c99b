//! Generic in-memory repositories

use crate::changeset::ChangeType;
use crate::context::MutationContext;
use crate::error::{Result, StoreError};
use dashmap::DashMap;
use keel_types::Entity;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Concurrent map of one entity kind; writes record into the context
#[derive(Debug)]
pub struct Repository<T: Entity> {
    items: DashMap<String, T>,
}

impl<T: Entity> Default for Repository<T> {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
        }
    }
}

impl<T: Entity> Repository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Insert or replace, returning the previous value
    pub fn upsert(&self, ctx: &MutationContext, entity: T) -> Result<Option<T>> {
        let id = entity.entity_id();
        if id.is_empty() {
            return Err(StoreError::Validation(format!("{} id must not be empty", T::KIND)));
        }
        let previous = self.items.insert(id.clone(), entity.clone());
        debug!(kind = %T::KIND, id = %id, replaced = previous.is_some(), "Upserted entity");
        ctx.record(ChangeType::Upsert, entity.into_record());
        Ok(previous)
    }

    /// Remove by id, returning the removed value; missing ids are a no-op
    pub fn remove(&self, ctx: &MutationContext, id: &str) -> Option<T> {
        let removed = self.items.remove(id).map(|(_, entity)| entity);
        if let Some(entity) = &removed {
            debug!(kind = %T::KIND, id = %id, "Removed entity");
            ctx.record(ChangeType::Delete, entity.clone().into_record());
        }
        removed
    }

    pub fn items(&self) -> HashMap<String, T> {
        self.items
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }

    /// Values matching a predicate
    pub fn filter<F>(&self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.items
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Repository with a secondary index from a grouping key to entity ids
pub struct IndexedRepository<T: Entity> {
    repo: Repository<T>,
    index: DashMap<String, BTreeSet<String>>,
    group_of: fn(&T) -> String,
}

impl<T: Entity + std::fmt::Debug> std::fmt::Debug for IndexedRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedRepository")
            .field("len", &self.repo.len())
            .field("groups", &self.index.len())
            .finish()
    }
}

impl<T: Entity> IndexedRepository<T> {
    pub fn new(group_of: fn(&T) -> String) -> Self {
        Self {
            repo: Repository::new(),
            index: DashMap::new(),
            group_of,
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.repo.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.repo.contains(id)
    }

    /// The primary map is written before the index; writers are expected to
    /// be serialized per workspace, and readers re-check the group
    pub fn upsert(&self, ctx: &MutationContext, entity: T) -> Result<Option<T>> {
        let id = entity.entity_id();
        let group = (self.group_of)(&entity);
        let previous = self.repo.upsert(ctx, entity)?;
        if let Some(prev) = &previous {
            let old_group = (self.group_of)(prev);
            if old_group != group {
                self.unindex(&old_group, &id);
            }
        }
        self.index.entry(group).or_default().insert(id);
        Ok(previous)
    }

    pub fn remove(&self, ctx: &MutationContext, id: &str) -> Option<T> {
        let removed = self.repo.remove(ctx, id);
        if let Some(entity) = &removed {
            self.unindex(&(self.group_of)(entity), id);
        }
        removed
    }

    /// Entities sharing a grouping key
    pub fn get_by_group(&self, group: &str) -> Vec<T> {
        let ids: Vec<String> = match self.index.get(group) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.repo.get(id))
            .filter(|entity| (self.group_of)(entity) == group)
            .collect()
    }

    pub fn items(&self) -> HashMap<String, T> {
        self.repo.items()
    }

    pub fn values(&self) -> Vec<T> {
        self.repo.values()
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.repo.filter(predicate)
    }

    pub fn len(&self) -> usize {
        self.repo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repo.is_empty()
    }

    fn unindex(&self, group: &str, id: &str) {
        let empty = match self.index.get_mut(group) {
            Some(mut ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if empty {
            self.index.remove_if(group, |_, ids| ids.is_empty());
        }
    }
}
