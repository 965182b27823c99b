//! Keel Queue - leased reconcile work with scope coalescing
//!
//! Work is keyed by a scope `(workspaceId, kind, scopeType, scopeId)` and
//! carries any number of payloads. Enqueues for a leased scope only add
//! payloads, so bursts of upstream events collapse into one unit of work.
//!
//! ## Backends
//!
//! - [`MemoryQueue`]: in-process, monotonic timestamps
//! - `PostgresQueue`: behind the `postgres` feature
//!
//! [`Worker`] drives a [`Processor`] over any backend.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod queue;
pub mod types;
pub mod worker;

pub use error::{QueueError, Result};
pub use memory::{MemoryQueue, MonotonicClock};
#[cfg(feature = "postgres")]
pub use postgres::PostgresQueue;
pub use queue::ReconcileQueue;
pub use types::{
    canonical_json, derive_payload_key, AckResult, ClaimParams, EnqueueParams, Item, Payload,
    PayloadInput, ScopeKey, CLOCK_SKEW_TOLERANCE, DEFAULT_PRIORITY,
};
pub use worker::{retry_backoff, ProcessError, ProcessOutcome, Processor, Worker, WorkerConfig};
