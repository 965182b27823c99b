//! Keel Store - change sets and in-memory repositories
//!
//! Every write goes through a [`MutationContext`]; when the context carries
//! a change set, the write is recorded so the release manager can react to
//! exactly what one request changed.
//!
//! Release targets are never written directly by callers: the `sync_*`
//! functions on [`Store`] derive them from deployments, environments and
//! resources.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod changeset;
pub mod context;
pub mod derive;
pub mod error;
pub mod release_targets;
pub mod repository;
pub mod store;

pub use changeset::{Change, ChangeKey, ChangeSet, ChangeType, ChangeView, DedupChangeSet};
pub use context::{MutationContext, StoreChangeSet};
pub use derive::TargetDiff;
pub use error::{Result, StoreError};
pub use repository::{IndexedRepository, Repository};
pub use store::Store;
