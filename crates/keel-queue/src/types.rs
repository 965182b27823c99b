//! Queue rows and operation parameters

use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Priority assigned when the caller gives none; lower claims first
pub const DEFAULT_PRIORITY: i32 = 100;

/// Tolerance subtracted from `now` for the default `not_before`
pub const CLOCK_SKEW_TOLERANCE: chrono::Duration = chrono::Duration::seconds(1);

/// Coalescing key of a unit of reconcile work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKey {
    pub workspace_id: String,
    pub kind: String,
    pub scope_type: String,
    pub scope_id: String,
}

impl ScopeKey {
    pub fn new(
        workspace_id: impl Into<String>,
        kind: impl Into<String>,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            kind: kind.into(),
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("workspaceId", &self.workspace_id),
            ("kind", &self.kind),
            ("scopeType", &self.scope_type),
            ("scopeId", &self.scope_id),
        ] {
            if value.is_empty() {
                return Err(QueueError::Validation(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.workspace_id, self.kind, self.scope_type, self.scope_id
        )
    }
}

/// Payload supplied at enqueue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadInput {
    pub payload_type: String,
    /// Derived from the payload contents when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_key: Option<String>,
    pub payload: Value,
}

impl PayloadInput {
    pub fn new(payload_type: impl Into<String>, payload: Value) -> Self {
        Self {
            payload_type: payload_type.into(),
            payload_key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.payload_key = Some(key.into());
        self
    }

    /// Caller-supplied key, or `sha256(type ":" canonical json)`
    pub fn resolved_key(&self) -> String {
        match &self.payload_key {
            Some(key) => key.clone(),
            None => derive_payload_key(&self.payload_type, &self.payload),
        }
    }
}

/// Hex SHA-256 of `payload_type ":" canonical_json(payload)`
pub fn derive_payload_key(payload_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload_type.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// JSON text with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Enqueue request
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueParams {
    pub scope: ScopeKey,
    pub payload: Option<PayloadInput>,
    pub priority: Option<i32>,
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueParams {
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            payload: None,
            priority: None,
            not_before: None,
        }
    }

    pub fn with_payload(mut self, payload: PayloadInput) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }
}

/// Claim request
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimParams {
    pub worker_id: String,
    pub batch_size: usize,
    pub lease_duration: Duration,
    /// Restrict to these kinds; `None` claims any kind
    pub kinds: Option<Vec<String>>,
}

impl ClaimParams {
    pub fn new(worker_id: impl Into<String>, batch_size: usize, lease_duration: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size,
            lease_duration,
            kinds: None,
        }
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn admits_kind(&self, kind: &str) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.iter().any(|k| k == kind))
    }
}

/// One payload attached to a claimed scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub payload_type: String,
    pub payload_key: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// A claimed scope with its aggregated payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: i64,
    pub scope: ScopeKey,
    pub event_ts: DateTime<Utc>,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    /// Scope `updated_at` as of the claim; pass back to `ack_success`
    pub updated_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub payloads: Vec<Payload>,
}

/// Outcome of `ack_success`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResult {
    /// The scope row was removed because no work remained
    pub deleted: bool,
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
