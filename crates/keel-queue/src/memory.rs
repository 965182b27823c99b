//! In-memory reconcile queue
//!
//! Single-process backend used by tests and single-node runs. Timestamps
//! come from a strictly monotonic clock so `updated_at` comparisons on ack
//! never tie between a claim and a later enqueue.

use crate::error::{QueueError, Result};
use crate::queue::ReconcileQueue;
use crate::types::{
    to_chrono, AckResult, ClaimParams, EnqueueParams, Item, Payload, ScopeKey,
    CLOCK_SKEW_TOLERANCE, DEFAULT_PRIORITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keel_types::{SharedClock, SystemClock};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Wraps a clock so successive readings strictly increase
#[derive(Debug)]
pub struct MonotonicClock {
    inner: SharedClock,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new(inner: SharedClock) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }

    /// Current time, bumped by 1µs past the previous reading if needed
    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let mut now = self.inner.now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + ChronoDuration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

#[derive(Debug, Clone)]
struct ScopeRow {
    id: i64,
    key: ScopeKey,
    event_ts: DateTime<Utc>,
    priority: i32,
    not_before: DateTime<Utc>,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    attempt_count: i32,
    last_error: Option<String>,
    /// Keyed by `(payload_type, payload_key)`, insertion-ordered by sequence
    payloads: BTreeMap<(String, String), PayloadRow>,
}

#[derive(Debug, Clone)]
struct PayloadRow {
    seq: u64,
    payload: Value,
    updated_at: DateTime<Utc>,
}

impl ScopeRow {
    fn leased_to(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.claimed_by.as_deref() == Some(worker_id)
            && self.claimed_until.is_some_and(|until| until > now)
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && self.claimed_until.map_or(true, |until| until <= now)
    }

    fn release(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }

    fn to_item(&self) -> Item {
        let mut payloads: Vec<(&(String, String), &PayloadRow)> = self.payloads.iter().collect();
        payloads.sort_by_key(|(_, row)| row.seq);
        Item {
            id: self.id,
            scope: self.key.clone(),
            event_ts: self.event_ts,
            priority: self.priority,
            not_before: self.not_before,
            claimed_by: self.claimed_by.clone(),
            claimed_until: self.claimed_until,
            updated_at: self.updated_at,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            payloads: payloads
                .into_iter()
                .map(|((payload_type, payload_key), row)| Payload {
                    payload_type: payload_type.clone(),
                    payload_key: payload_key.clone(),
                    payload: row.payload.clone(),
                    updated_at: row.updated_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    next_seq: u64,
    scopes: HashMap<i64, ScopeRow>,
    by_key: HashMap<ScopeKey, i64>,
}

/// Reconcile queue held in process memory
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    clock: MonotonicClock,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock: MonotonicClock::new(clock),
        }
    }

    /// Number of scope rows, claimed or not
    pub fn scope_count(&self) -> usize {
        self.state.lock().scopes.len()
    }

    /// Snapshot of a scope row by key
    pub fn inspect(&self, key: &ScopeKey) -> Option<Item> {
        let state = self.state.lock();
        state
            .by_key
            .get(key)
            .and_then(|id| state.scopes.get(id))
            .map(ScopeRow::to_item)
    }

    fn with_owned<T>(
        &self,
        item_id: i64,
        worker_id: &str,
        f: impl FnOnce(&mut ScopeRow, DateTime<Utc>) -> T,
    ) -> Result<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.scopes.get_mut(&item_id) {
            Some(row) if row.leased_to(worker_id, now) => Ok(f(row, now)),
            _ => Err(QueueError::not_owned(item_id, worker_id)),
        }
    }
}

#[async_trait]
impl ReconcileQueue for MemoryQueue {
    async fn enqueue(&self, params: EnqueueParams) -> Result<()> {
        params.scope.validate()?;
        let now = self.clock.now();
        let priority = params.priority.unwrap_or(DEFAULT_PRIORITY);
        let not_before = params.not_before.unwrap_or(now - CLOCK_SKEW_TOLERANCE);

        let mut state = self.state.lock();
        let id = match state.by_key.get(&params.scope).copied() {
            Some(id) => id,
            None => {
                state.next_id += 1;
                let id = state.next_id;
                state.by_key.insert(params.scope.clone(), id);
                state.scopes.insert(
                    id,
                    ScopeRow {
                        id,
                        key: params.scope.clone(),
                        event_ts: now,
                        priority,
                        not_before,
                        claimed_by: None,
                        claimed_until: None,
                        updated_at: now,
                        attempt_count: 0,
                        last_error: None,
                        payloads: BTreeMap::new(),
                    },
                );
                id
            }
        };

        state.next_seq += 1;
        let seq = state.next_seq;
        let Some(row) = state.scopes.get_mut(&id) else {
            return Err(QueueError::Storage(format!("scope row {} vanished", id)));
        };
        row.priority = row.priority.min(priority);
        row.not_before = row.not_before.min(not_before);
        row.updated_at = now;

        if let Some(payload) = params.payload {
            let key = (payload.payload_type.clone(), payload.resolved_key());
            let entry = row.payloads.entry(key).or_insert(PayloadRow {
                seq,
                payload: Value::Null,
                updated_at: now,
            });
            entry.payload = payload.payload;
            entry.updated_at = now;
        }
        trace!(scope = %params.scope, payloads = row.payloads.len(), "Enqueued");
        Ok(())
    }

    async fn claim(&self, params: ClaimParams) -> Result<Vec<Item>> {
        if params.batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let lease_end = now + to_chrono(params.lease_duration);

        let mut state = self.state.lock();
        let mut ready: Vec<&ScopeRow> = state
            .scopes
            .values()
            .filter(|row| row.claimable(now) && params.admits_kind(&row.key.kind))
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.event_ts.cmp(&b.event_ts))
                .then(a.id.cmp(&b.id))
        });
        let ids: Vec<i64> = ready.iter().take(params.batch_size).map(|r| r.id).collect();

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = state.scopes.get_mut(&id) {
                row.claimed_by = Some(params.worker_id.clone());
                row.claimed_until = Some(lease_end);
                row.updated_at = now;
                items.push(row.to_item());
            }
        }
        if !items.is_empty() {
            debug!(worker_id = %params.worker_id, claimed = items.len(), "Claimed scopes");
        }
        Ok(items)
    }

    async fn extend_lease(&self, item_id: i64, worker_id: &str, lease_duration: Duration) -> Result<()> {
        self.with_owned(item_id, worker_id, |row, now| {
            row.claimed_until = Some(now + to_chrono(lease_duration));
        })
    }

    async fn ack_success(
        &self,
        item_id: i64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> Result<AckResult> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let remove = match state.scopes.get_mut(&item_id) {
            Some(row) if row.leased_to(worker_id, now) => {
                row.payloads
                    .retain(|_, payload| payload.updated_at > claimed_updated_at);
                row.release();
                row.payloads.is_empty() && row.updated_at <= claimed_updated_at
            }
            _ => return Err(QueueError::not_owned(item_id, worker_id)),
        };
        // Removed under the same guard as the ownership check
        if remove {
            if let Some(row) = state.scopes.remove(&item_id) {
                state.by_key.remove(&row.key);
            }
        }
        Ok(AckResult { deleted: remove })
    }

    async fn retry(
        &self,
        item_id: i64,
        worker_id: &str,
        last_error: &str,
        retry_backoff: Duration,
    ) -> Result<()> {
        self.with_owned(item_id, worker_id, |row, now| {
            row.attempt_count += 1;
            row.last_error = Some(last_error.to_string());
            row.not_before = now + to_chrono(retry_backoff);
            row.release();
        })
    }

    async fn reschedule(&self, item_id: i64, worker_id: &str, delay: Duration) -> Result<()> {
        self.with_owned(item_id, worker_id, |row, now| {
            row.not_before = now + to_chrono(delay);
            row.release();
        })
    }
}
