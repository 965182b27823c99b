//! Keel Broker - partitioned pub/sub for the event stream
//!
//! [`Producer`] and [`Consumer`] are the seam a remote broker plugs into.
//! [`MemoryBroker`] implements them in process for tests and single-node
//! runs: per-key ordering within a partition, group-shared cursors, commit
//! and seek.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
pub mod message;

pub use error::{BrokerError, Result};
pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
pub use message::{partition_for, Consumer, Delivery, Message, Producer};
