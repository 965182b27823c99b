//! Generic reconcile worker loop
//!
//! Claims batches from a [`ReconcileQueue`], runs each item through a
//! [`Processor`] under a concurrency bound, keeps leases alive with a
//! heartbeat, and maps the processor's outcome onto ack / reschedule /
//! retry.

use crate::error::{QueueError, Result};
use crate::queue::ReconcileQueue;
use crate::types::{ClaimParams, Item};
use async_trait::async_trait;
use keel_types::{cancel_pair, CancelToken};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// Successful processing outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Work is complete; ack the claimed payloads
    Done,
    /// Programmed deferral; run again after the delay without counting a failure
    RequeueAfter(Duration),
}

/// Processing failure, classified for the worker
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Transient failure; retry with backoff
    #[error("retryable: {0}")]
    Retryable(String),

    /// Lease lost mid-flight; drop without ack
    #[error("lease lost")]
    NotOwned,

    #[error("cancelled")]
    Cancelled,

    /// Retrying cannot help; the payloads are acked and the error logged
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<QueueError> for ProcessError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotOwned { .. } => ProcessError::NotOwned,
            QueueError::Cancelled => ProcessError::Cancelled,
            QueueError::Validation(msg) => ProcessError::Fatal(msg),
            QueueError::Storage(msg) => ProcessError::Retryable(msg),
        }
    }
}

/// Business logic run for each claimed scope
#[async_trait]
pub trait Processor: Send + Sync {
    /// `cancel` fires when the lease is lost
    async fn process(
        &self,
        cancel: &CancelToken,
        item: &Item,
    ) -> std::result::Result<ProcessOutcome, ProcessError>;
}

/// Worker loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub lease_duration: Duration,
    #[serde(with = "millis")]
    pub lease_heartbeat: Duration,
    pub max_concurrency: usize,
    #[serde(with = "millis")]
    pub base_retry_backoff: Duration,
    #[serde(with = "millis")]
    pub max_retry_backoff: Duration,
    /// Kinds this worker claims; `None` for all
    pub kinds: Option<Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", keel_types::new_id()),
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(30),
            lease_heartbeat: Duration::from_secs(10),
            max_concurrency: 8,
            base_retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(300),
            kinds: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `min(base * 2^attempts, max)`
pub fn retry_backoff(base: Duration, max: Duration, attempts: i32) -> Duration {
    let exponent = attempts.clamp(0, 31) as u32;
    base.checked_mul(1u32 << exponent)
        .map_or(max, |backoff| backoff.min(max))
}

/// Claims and processes reconcile work until cancelled
pub struct Worker<Q: ?Sized, P: ?Sized> {
    queue: Arc<Q>,
    processor: Arc<P>,
    config: WorkerConfig,
}

impl<Q, P> Worker<Q, P>
where
    Q: ReconcileQueue + ?Sized + 'static,
    P: Processor + ?Sized + 'static,
{
    pub fn new(queue: Arc<Q>, processor: Arc<P>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` fires, then wait for in-flight items
    pub async fn run(&self, shutdown: CancelToken) -> Result<()> {
        let concurrency = self.config.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        info!(worker_id = %self.config.worker_id, concurrency, "Reconcile worker started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Reconcile task panicked");
                }
            }

            let first = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let mut permits = vec![first];
            while permits.len() < self.config.batch_size.max(1) {
                match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let mut params = ClaimParams::new(
                self.config.worker_id.clone(),
                permits.len(),
                self.config.lease_duration,
            );
            params.kinds = self.config.kinds.clone();

            let items = match self.queue.claim(params).await {
                Ok(items) => items,
                Err(e) => {
                    error!(error = %e, "Claim failed");
                    Vec::new()
                }
            };

            if items.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    _ = shutdown.cancelled() => break,
                }
            }

            for (item, permit) in items.into_iter().zip(permits) {
                let span = tracing::info_span!(
                    "reconcile_item",
                    item_id = item.id,
                    kind = %item.scope.kind,
                    scope_id = %item.scope.scope_id,
                );
                tasks.spawn(
                    handle_item(
                        self.queue.clone(),
                        self.processor.clone(),
                        self.config.clone(),
                        item,
                        permit,
                    )
                    .instrument(span),
                );
            }
        }

        info!(in_flight = tasks.len(), "Reconcile worker draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconcile task panicked");
            }
        }
        info!(worker_id = %self.config.worker_id, "Reconcile worker stopped");
        Ok(())
    }

    /// Claim once and process the batch to completion
    pub async fn run_once(&self) -> Result<usize> {
        let mut params = ClaimParams::new(
            self.config.worker_id.clone(),
            self.config.batch_size.max(1),
            self.config.lease_duration,
        );
        params.kinds = self.config.kinds.clone();
        let items = self.queue.claim(params).await?;
        let count = items.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for item in items {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| QueueError::Storage(e.to_string()))?;
            tasks.spawn(handle_item(
                self.queue.clone(),
                self.processor.clone(),
                self.config.clone(),
                item,
                permit,
            ));
        }
        while tasks.join_next().await.is_some() {}
        Ok(count)
    }
}

async fn handle_item<Q, P>(
    queue: Arc<Q>,
    processor: Arc<P>,
    config: WorkerConfig,
    item: Item,
    _permit: OwnedSemaphorePermit,
) where
    Q: ReconcileQueue + ?Sized + 'static,
    P: Processor + ?Sized + 'static,
{
    let (lease_lost, lease_token) = cancel_pair();
    let (stop_heartbeat, heartbeat_stopped) = cancel_pair();

    let heartbeat = {
        let queue = queue.clone();
        let worker_id = config.worker_id.clone();
        let item_id = item.id;
        let every = config.lease_heartbeat;
        let lease = config.lease_duration;
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(every) => {}
                    _ = heartbeat_stopped.cancelled() => return,
                }
                match queue.extend_lease(item_id, &worker_id, lease).await {
                    Ok(()) => debug!(item_id, "Lease extended"),
                    Err(QueueError::NotOwned { .. }) => {
                        warn!(item_id, "Lease lost during processing");
                        lease_lost.cancel();
                        return;
                    }
                    Err(e) => warn!(item_id, error = %e, "Lease extension failed"),
                }
            }
        }
    };
    let heartbeat = tokio::spawn(heartbeat.in_current_span());

    let outcome = processor.process(&lease_token, &item).await;
    stop_heartbeat.cancel();
    let _ = heartbeat.await;

    let worker_id = config.worker_id.as_str();
    let settled = match outcome {
        Ok(ProcessOutcome::Done) => queue
            .ack_success(item.id, worker_id, item.updated_at)
            .await
            .map(|ack| debug!(deleted = ack.deleted, "Acked")),
        Ok(ProcessOutcome::RequeueAfter(delay)) => {
            debug!(delay_ms = delay.as_millis() as u64, "Requeued");
            queue.reschedule(item.id, worker_id, delay).await
        }
        Err(ProcessError::Retryable(message)) => {
            let backoff = retry_backoff(
                config.base_retry_backoff,
                config.max_retry_backoff,
                item.attempt_count,
            );
            warn!(error = %message, attempt = item.attempt_count + 1, backoff_ms = backoff.as_millis() as u64, "Processing failed; will retry");
            queue.retry(item.id, worker_id, &message, backoff).await
        }
        Err(ProcessError::Fatal(message)) => {
            error!(error = %message, "Processing failed permanently; dropping payloads");
            queue
                .ack_success(item.id, worker_id, item.updated_at)
                .await
                .map(|_| ())
        }
        Err(ProcessError::NotOwned) => {
            debug!("Lease lost; item dropped");
            Ok(())
        }
        Err(ProcessError::Cancelled) => {
            debug!("Processing cancelled");
            Ok(())
        }
    };

    match settled {
        Ok(()) => {}
        Err(QueueError::NotOwned { .. }) => warn!("Lease lost before settling item"),
        Err(e) => error!(error = %e, "Failed to settle item"),
    }
}
