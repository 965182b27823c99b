//! Keel Engine - event ingest and reconcile wiring for one workspace
//!
//! The engine consumes the workspace event topic, applies each event to the
//! store inside its own change set, and hands that change set to the
//! release manager. Deferred and long-running work (selector
//! re-derivation, time-based re-planning) flows through the reconcile queue
//! and is drained by the worker.
//!
//! ## Components
//!
//! - [`Envelope`] / [`EventType`]: the event wire format
//! - [`EventHandler`]: per-event store mutations
//! - [`BatchCache`]: claim-check storage for provider resource batches
//! - [`Workspace`]: façade over store, state index and release manager
//! - [`Ingestor`]: broker consumer loop with commit / rewind semantics
//! - [`Server`]: assembles everything for the `keeld` binary

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handlers;
pub mod ingest;
pub mod processors;
pub mod server;
pub mod workspace;

pub use batch::BatchCache;
pub use config::{EngineConfig, QueueConfig};
pub use dispatch::IntegrationDispatcher;
pub use error::{EngineError, Result};
pub use event::{read_envelopes, Action, Envelope, EventType, Subject};
pub use handlers::{EventHandler, Handled, JobStatusUpdate, SetResources};
pub use ingest::{Ingestor, Outcome};
pub use processors::{
    desired_release_work, selector_eval_work, DesiredReleaseProcessor, KindRouter, QueueScheduler,
    SelectorEvalProcessor, KIND_DESIRED_RELEASE, KIND_SELECTOR_EVAL,
};
pub use server::Server;
pub use workspace::{Workspace, WorkspaceBuilder};
