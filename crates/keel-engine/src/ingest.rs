//! Event ingest loop
//!
//! Reads the workspace topic, applies each event and commits its offset.
//! A retriable failure seeks the partition back so the same event is read
//! again after a pause; any other failure is logged and committed so one
//! bad event cannot wedge the partition.

use crate::error::Result;
use crate::event::Envelope;
use crate::workspace::Workspace;
use keel_broker::{Consumer, Message};
use keel_types::CancelToken;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Another workspace's event, or one that could not be decoded
    Skipped,
    /// Non-retriable failure; committed
    Failed(String),
    /// Retriable failure; offset rewound
    Deferred(String),
}

pub struct Ingestor {
    consumer: Arc<dyn Consumer>,
    workspace: Arc<Workspace>,
    read_timeout: Duration,
    retry_delay: Duration,
}

impl Ingestor {
    pub fn new(consumer: Arc<dyn Consumer>, workspace: Arc<Workspace>) -> Self {
        Self {
            consumer,
            workspace,
            read_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run until `shutdown` fires
    pub async fn run(&self, shutdown: CancelToken) -> Result<()> {
        info!(workspace_id = %self.workspace.id(), "Event ingest started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let outcome = tokio::select! {
                outcome = self.poll(&shutdown) => outcome,
                _ = shutdown.cancelled() => break,
            };
            match outcome {
                Ok(Some(Outcome::Deferred(_))) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Event ingest iteration failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        info!(workspace_id = %self.workspace.id(), "Event ingest stopped");
        Ok(())
    }

    /// Read and handle at most one message; `None` when the read timed out
    pub async fn poll(&self, cancel: &CancelToken) -> Result<Option<Outcome>> {
        let Some(message) = self.consumer.read_message(self.read_timeout).await? else {
            return Ok(None);
        };
        let outcome = self.handle(&message, cancel).await;
        match &outcome {
            Outcome::Deferred(reason) => {
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    reason = %reason,
                    "Event deferred; rewinding"
                );
                self.consumer.seek(message.partition, message.offset).await?;
            }
            _ => self.consumer.commit(&message).await?,
        }
        Ok(Some(outcome))
    }

    async fn handle(&self, message: &Message, cancel: &CancelToken) -> Outcome {
        let envelope = match Envelope::decode(&message.value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable event skipped"
                );
                return Outcome::Skipped;
            }
        };
        if envelope.workspace_id != self.workspace.id() {
            debug!(workspace_id = %envelope.workspace_id, "Event for another workspace skipped");
            return Outcome::Skipped;
        }

        match self.workspace.apply(&envelope, cancel).await {
            Ok(_) => Outcome::Applied,
            Err(e) if e.is_retriable() => Outcome::Deferred(e.to_string()),
            Err(e) => {
                error!(
                    event_type = %envelope.event_type,
                    offset = message.offset,
                    error = %e,
                    "Event failed"
                );
                Outcome::Failed(e.to_string())
            }
        }
    }
}
