//! PostgreSQL reconcile queue
//!
//! Two tables: `reconcile_work_scope` (one row per coalescing key, carrying
//! the lease) and `reconcile_work_payload` (many rows per scope). Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never lease the same scope.

use crate::error::{QueueError, Result};
use crate::queue::ReconcileQueue;
use crate::types::{
    AckResult, ClaimParams, EnqueueParams, Item, Payload, ScopeKey, CLOCK_SKEW_TOLERANCE,
    DEFAULT_PRIORITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS reconcile_work_scope (
        id BIGSERIAL PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        scope_type TEXT NOT NULL,
        scope_id TEXT NOT NULL,
        event_ts TIMESTAMPTZ NOT NULL,
        priority INTEGER NOT NULL DEFAULT 100,
        not_before TIMESTAMPTZ NOT NULL,
        claimed_by TEXT,
        claimed_until TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        UNIQUE (workspace_id, kind, scope_type, scope_id)
    );
    "#,
    r#"CREATE INDEX IF NOT EXISTS reconcile_work_scope_claim ON reconcile_work_scope(kind, not_before, priority, event_ts, claimed_until);"#,
    r#"
    CREATE TABLE IF NOT EXISTS reconcile_work_payload (
        id BIGSERIAL PRIMARY KEY,
        scope_ref BIGINT NOT NULL REFERENCES reconcile_work_scope(id) ON DELETE CASCADE,
        payload_type TEXT NOT NULL,
        payload_key TEXT NOT NULL,
        payload JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (scope_ref, payload_type, payload_key)
    );
    "#,
    r#"CREATE INDEX IF NOT EXISTS reconcile_work_payload_scope ON reconcile_work_payload(scope_ref);"#,
];

/// Reconcile queue stored in PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    /// Connect and create the schema if missing
    pub async fn connect(url: &str, max_connections: u32, connect_timeout_secs: u64) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await?;
        let queue = Self { pool };
        queue.initialize_schema().await?;
        info!(max_connections, "Connected reconcile queue to PostgreSQL");
        Ok(queue)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_payloads(&self, scope_ids: &[i64]) -> Result<HashMap<i64, Vec<Payload>>> {
        let rows = sqlx::query(
            "SELECT scope_ref, payload_type, payload_key, payload, updated_at \
             FROM reconcile_work_payload WHERE scope_ref = ANY($1) ORDER BY id",
        )
        .bind(scope_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<i64, Vec<Payload>> = HashMap::new();
        for row in rows {
            let scope_ref: i64 = row.try_get("scope_ref")?;
            grouped.entry(scope_ref).or_default().push(Payload {
                payload_type: row.try_get("payload_type")?,
                payload_key: row.try_get("payload_key")?,
                payload: row.try_get::<Value, _>("payload")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(grouped)
    }

    /// Run an update guarded by lease ownership
    async fn owned_update(
        &self,
        item_id: i64,
        worker_id: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<()> {
        let affected = query.execute(&self.pool).await?.rows_affected();
        if affected == 0 {
            return Err(QueueError::not_owned(item_id, worker_id));
        }
        Ok(())
    }
}

fn scope_item(row: &PgRow) -> Result<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        scope: ScopeKey {
            workspace_id: row.try_get("workspace_id")?,
            kind: row.try_get("kind")?,
            scope_type: row.try_get("scope_type")?,
            scope_id: row.try_get("scope_id")?,
        },
        event_ts: row.try_get("event_ts")?,
        priority: row.try_get("priority")?,
        not_before: row.try_get("not_before")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_until: row.try_get("claimed_until")?,
        updated_at: row.try_get("updated_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        payloads: Vec::new(),
    })
}

#[async_trait]
impl ReconcileQueue for PostgresQueue {
    async fn enqueue(&self, params: EnqueueParams) -> Result<()> {
        params.scope.validate()?;
        let priority = params.priority.unwrap_or(DEFAULT_PRIORITY);
        let not_before = params
            .not_before
            .unwrap_or_else(|| Utc::now() - CLOCK_SKEW_TOLERANCE);

        let mut tx = self.pool.begin().await?;
        let scope_id: i64 = sqlx::query(
            r#"
            INSERT INTO reconcile_work_scope
                (workspace_id, kind, scope_type, scope_id, event_ts, priority, not_before, updated_at)
            VALUES ($1, $2, $3, $4, now(), $5, $6, clock_timestamp())
            ON CONFLICT (workspace_id, kind, scope_type, scope_id) DO UPDATE
            SET priority = LEAST(reconcile_work_scope.priority, EXCLUDED.priority),
                not_before = LEAST(reconcile_work_scope.not_before, EXCLUDED.not_before),
                updated_at = clock_timestamp()
            RETURNING id
            "#,
        )
        .bind(&params.scope.workspace_id)
        .bind(&params.scope.kind)
        .bind(&params.scope.scope_type)
        .bind(&params.scope.scope_id)
        .bind(priority)
        .bind(not_before)
        .fetch_one(&mut *tx)
        .await?
        .try_get("id")?;

        if let Some(payload) = &params.payload {
            sqlx::query(
                r#"
                INSERT INTO reconcile_work_payload
                    (scope_ref, payload_type, payload_key, payload, updated_at)
                VALUES ($1, $2, $3, $4, clock_timestamp())
                ON CONFLICT (scope_ref, payload_type, payload_key) DO UPDATE
                SET payload = EXCLUDED.payload, updated_at = clock_timestamp()
                "#,
            )
            .bind(scope_id)
            .bind(&payload.payload_type)
            .bind(payload.resolved_key())
            .bind(&payload.payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(scope = %params.scope, "Enqueued");
        Ok(())
    }

    async fn claim(&self, params: ClaimParams) -> Result<Vec<Item>> {
        if params.batch_size == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM reconcile_work_scope
                WHERE not_before <= now()
                  AND (claimed_until IS NULL OR claimed_until <= now())
                  AND ($4::text[] IS NULL OR kind = ANY($4))
                ORDER BY priority ASC, event_ts ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE reconcile_work_scope s
            SET claimed_by = $1,
                claimed_until = now() + make_interval(secs => $2),
                updated_at = clock_timestamp()
            FROM claimable c
            WHERE s.id = c.id
            RETURNING s.id, s.workspace_id, s.kind, s.scope_type, s.scope_id, s.event_ts,
                      s.priority, s.not_before, s.claimed_by, s.claimed_until, s.updated_at,
                      s.attempt_count, s.last_error
            "#,
        )
            .bind(&params.worker_id)
            .bind(params.lease_duration.as_secs_f64())
            .bind(params.batch_size as i64)
            .bind(params.kinds.as_deref())
            .fetch_all(&self.pool)
            .await?;

        let mut items = rows.iter().map(scope_item).collect::<Result<Vec<_>>>()?;
        items.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.event_ts.cmp(&b.event_ts)));
        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        let mut payloads = self.fetch_payloads(&ids).await?;
        for item in &mut items {
            item.payloads = payloads.remove(&item.id).unwrap_or_default();
        }
        if !items.is_empty() {
            debug!(worker_id = %params.worker_id, claimed = items.len(), "Claimed scopes");
        }
        Ok(items)
    }

    async fn extend_lease(&self, item_id: i64, worker_id: &str, lease_duration: Duration) -> Result<()> {
        let query = sqlx::query(
            "UPDATE reconcile_work_scope \
             SET claimed_until = now() + make_interval(secs => $3) \
             WHERE id = $1 AND claimed_by = $2 AND claimed_until > now()",
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(lease_duration.as_secs_f64());
        self.owned_update(item_id, worker_id, query).await
    }

    async fn ack_success(
        &self,
        item_id: i64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> Result<AckResult> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT updated_at FROM reconcile_work_scope \
             WHERE id = $1 AND claimed_by = $2 AND claimed_until > now() FOR UPDATE",
        )
        .bind(item_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(QueueError::not_owned(item_id, worker_id));
        };
        let scope_updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        sqlx::query("DELETE FROM reconcile_work_payload WHERE scope_ref = $1 AND updated_at <= $2")
            .bind(item_id)
            .bind(claimed_updated_at)
            .execute(&mut *tx)
            .await?;
        let remaining: i64 =
            sqlx::query("SELECT COUNT(*) AS remaining FROM reconcile_work_payload WHERE scope_ref = $1")
                .bind(item_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get("remaining")?;

        let deleted = remaining == 0 && scope_updated_at <= claimed_updated_at;
        if deleted {
            sqlx::query("DELETE FROM reconcile_work_scope WHERE id = $1")
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE reconcile_work_scope SET claimed_by = NULL, claimed_until = NULL WHERE id = $1",
            )
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(AckResult { deleted })
    }

    async fn retry(
        &self,
        item_id: i64,
        worker_id: &str,
        last_error: &str,
        retry_backoff: Duration,
    ) -> Result<()> {
        let query = sqlx::query(
            "UPDATE reconcile_work_scope \
             SET attempt_count = attempt_count + 1, last_error = $3, \
                 not_before = now() + make_interval(secs => $4), \
                 claimed_by = NULL, claimed_until = NULL \
             WHERE id = $1 AND claimed_by = $2 AND claimed_until > now()",
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(last_error)
        .bind(retry_backoff.as_secs_f64());
        self.owned_update(item_id, worker_id, query).await
    }

    async fn reschedule(&self, item_id: i64, worker_id: &str, delay: Duration) -> Result<()> {
        let query = sqlx::query(
            "UPDATE reconcile_work_scope \
             SET not_before = now() + make_interval(secs => $3), \
                 claimed_by = NULL, claimed_until = NULL \
             WHERE id = $1 AND claimed_by = $2 AND claimed_until > now()",
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(delay.as_secs_f64());
        self.owned_update(item_id, worker_id, query).await
    }
}
