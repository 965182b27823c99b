//! Ambient mutation context
//!
//! Every repository write takes a [`MutationContext`]. When a change set is
//! attached, the write is recorded into it; the release manager later
//! consumes that change set as one unit.

use crate::changeset::{ChangeSet, ChangeType};
use keel_types::{CancelToken, EntityRecord};
use std::sync::Arc;

/// Change log of entity mutations
pub type StoreChangeSet = ChangeSet<EntityRecord>;

/// Per-request context carried through store writes
#[derive(Debug, Clone)]
pub struct MutationContext {
    changes: Option<Arc<StoreChangeSet>>,
    cancel: CancelToken,
}

impl Default for MutationContext {
    fn default() -> Self {
        Self::detached()
    }
}

impl MutationContext {
    /// Context recording into a fresh change set
    pub fn new() -> Self {
        Self::with_changes(Arc::new(ChangeSet::new()))
    }

    pub fn with_changes(changes: Arc<StoreChangeSet>) -> Self {
        Self {
            changes: Some(changes),
            cancel: CancelToken::never(),
        }
    }

    /// Context whose writes are not recorded anywhere
    pub fn detached() -> Self {
        Self {
            changes: None,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn record(&self, change_type: ChangeType, entity: EntityRecord) {
        if let Some(changes) = &self.changes {
            changes.record(change_type, entity);
        }
    }

    pub fn changes(&self) -> Option<&Arc<StoreChangeSet>> {
        self.changes.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}
