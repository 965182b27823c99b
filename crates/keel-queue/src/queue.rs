//! The reconcile queue contract

use crate::error::Result;
use crate::types::{AckResult, ClaimParams, EnqueueParams, Item};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Leased work queue with scope coalescing
///
/// At most one worker holds the lease on a scope at a time. Enqueues for a
/// leased scope only add payloads; the scope becomes claimable again after
/// the current holder acks, retries or loses the lease.
#[async_trait]
pub trait ReconcileQueue: Send + Sync {
    /// Upsert the scope and, if given, its payload
    async fn enqueue(&self, params: EnqueueParams) -> Result<()>;

    /// Lease up to `batch_size` ready scopes, cheapest priority then oldest first
    async fn claim(&self, params: ClaimParams) -> Result<Vec<Item>>;

    /// Push the lease end out to `now + lease_duration`
    async fn extend_lease(&self, item_id: i64, worker_id: &str, lease_duration: Duration) -> Result<()>;

    /// Drop payloads last touched at or before `claimed_updated_at`; remove
    /// the scope when nothing remains
    async fn ack_success(
        &self,
        item_id: i64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> Result<AckResult>;

    /// Release the lease after a failure, counting an attempt
    async fn retry(
        &self,
        item_id: i64,
        worker_id: &str,
        last_error: &str,
        retry_backoff: Duration,
    ) -> Result<()>;

    /// Release the lease and defer the scope without counting an attempt
    async fn reschedule(&self, item_id: i64, worker_id: &str, delay: Duration) -> Result<()>;
}
