//! PostgreSQL outbox adapter
//!
//! [`PgOutboxStore`] implements [`OutboxStore`] over a deadpool-postgres pool.
//! Claiming uses `FOR UPDATE SKIP LOCKED`, so concurrent projectors never
//! block on, or double-claim, each other's rows. Writers stage rows with
//! [`append_in_transaction`] on the same transaction as their entity write.

use std::collections::BTreeMap;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use warden_core::{
    NewOutboxRecord, OutboxId, OutboxRecord, OutboxStatus, StorageError, Timestamp, WardenResult,
};

use crate::store::OutboxStore;

/// DDL for the outbox table and its claim indexes.
pub const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS warden_outbox (
    id               BIGSERIAL PRIMARY KEY,
    aggregate_type   TEXT        NOT NULL,
    aggregate_id     TEXT        NOT NULL,
    event_type       TEXT        NOT NULL,
    payload          TEXT        NOT NULL,
    headers          JSONB       NOT NULL DEFAULT '{}'::jsonb,
    occurred_at      TIMESTAMPTZ NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    dispatched_at    TIMESTAMPTZ,
    status           TEXT        NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'publishing', 'published', 'error')),
    deliver_attempts INTEGER     NOT NULL DEFAULT 0,
    last_error       TEXT,
    partition_key    TEXT        NOT NULL,
    locked_by        TEXT,
    locked_at        TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS warden_outbox_pending_idx
    ON warden_outbox (id) WHERE status = 'pending';

CREATE INDEX IF NOT EXISTS warden_outbox_publishing_idx
    ON warden_outbox (locked_at) WHERE status = 'publishing';
"#;

const COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, headers, \
     occurred_at, created_at, dispatched_at, status, deliver_attempts, last_error, \
     partition_key, locked_by, locked_at";

const INSERT: &str = "INSERT INTO warden_outbox \
     (aggregate_type, aggregate_id, event_type, payload, headers, occurred_at, partition_key) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend {
        reason: e.to_string(),
    }
}

fn record_from_row(row: &tokio_postgres::Row) -> WardenResult<OutboxRecord> {
    let headers: serde_json::Value = row.try_get("headers").map_err(backend)?;
    let headers: BTreeMap<String, String> = serde_json::from_value(headers).map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    let attempts: i32 = row.try_get("deliver_attempts").map_err(backend)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(backend)?,
        aggregate_type: row.try_get("aggregate_type").map_err(backend)?,
        aggregate_id: row.try_get("aggregate_id").map_err(backend)?,
        event_type: row.try_get("event_type").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        headers,
        occurred_at: row.try_get("occurred_at").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        dispatched_at: row.try_get("dispatched_at").map_err(backend)?,
        status: OutboxStatus::from_db_str(&status).map_err(backend)?,
        deliver_attempts: attempts_from_db(attempts)?,
        last_error: row.try_get("last_error").map_err(backend)?,
        partition_key: row.try_get("partition_key").map_err(backend)?,
        locked_by: row.try_get("locked_by").map_err(backend)?,
        locked_at: row.try_get("locked_at").map_err(backend)?,
    })
}

/// A negative count means the row was tampered with; retrying it would never
/// reach `max_retry`.
fn attempts_from_db(attempts: i32) -> Result<u32, StorageError> {
    u32::try_from(attempts).map_err(|_| StorageError::Backend {
        reason: format!("corrupt deliver_attempts {attempts}"),
    })
}

/// Insert outbox rows on an open transaction. Returns the number inserted.
pub async fn append_in_transaction(
    tx: &tokio_postgres::Transaction<'_>,
    records: &[NewOutboxRecord],
) -> WardenResult<u64> {
    if records.is_empty() {
        return Ok(0);
    }
    let statement = tx.prepare(INSERT).await.map_err(backend)?;
    let mut inserted = 0;
    for record in records {
        let headers = serde_json::to_value(&record.headers).map_err(backend)?;
        inserted += tx
            .execute(
                &statement,
                &[
                    &record.aggregate_type,
                    &record.aggregate_id,
                    &record.event_type,
                    &record.payload,
                    &headers,
                    &record.occurred_at,
                    &record.partition_key,
                ],
            )
            .await
            .map_err(backend)?;
    }
    Ok(inserted)
}

/// [`OutboxStore`] over PostgreSQL.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: Pool,
}

impl PgOutboxStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> WardenResult<deadpool_postgres::Object> {
        Ok(self.pool.get().await.map_err(backend)?)
    }

    /// Create the outbox table and indexes if missing.
    pub async fn migrate(&self) -> WardenResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(OUTBOX_SCHEMA).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_pending(
        &self,
        batch_size: usize,
        claimant: &str,
    ) -> WardenResult<Vec<OutboxRecord>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "WITH claimable AS ( \
                 SELECT id FROM warden_outbox \
                 WHERE status = 'pending' \
                 ORDER BY id \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE warden_outbox o \
             SET status = 'publishing', locked_by = $2, locked_at = now() \
             FROM claimable \
             WHERE o.id = claimable.id \
             RETURNING {}",
            COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = conn
            .query(sql.as_str(), &[&(batch_size as i64), &claimant])
            .await
            .map_err(backend)?;

        let mut claimed = rows
            .iter()
            .map(record_from_row)
            .collect::<WardenResult<Vec<_>>>()?;
        claimed.sort_by_key(|r| r.id);
        Ok(claimed)
    }

    async fn mark_published(&self, id: OutboxId, claimant: &str) -> WardenResult<bool> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE warden_outbox \
                 SET status = 'published', dispatched_at = now(), \
                     locked_by = NULL, locked_at = NULL \
                 WHERE id = $1 AND status = 'publishing' AND locked_by = $2",
                &[&id, &claimant],
            )
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn record_failure(
        &self,
        id: OutboxId,
        claimant: &str,
        error: &str,
        max_retry: u32,
    ) -> WardenResult<Option<OutboxStatus>> {
        let conn = self.get_conn().await?;
        let max_retry = i32::try_from(max_retry).unwrap_or(i32::MAX);
        let row = conn
            .query_opt(
                "UPDATE warden_outbox \
                 SET deliver_attempts = deliver_attempts + 1, \
                     last_error = $3, \
                     status = CASE WHEN deliver_attempts + 1 >= $4 \
                                   THEN 'error' ELSE 'pending' END, \
                     locked_by = NULL, locked_at = NULL \
                 WHERE id = $1 AND status = 'publishing' AND locked_by = $2 \
                 RETURNING status",
                &[&id, &claimant, &error, &max_retry],
            )
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let status: String = row.try_get(0).map_err(backend)?;
                Ok(Some(OutboxStatus::from_db_str(&status).map_err(backend)?))
            }
            None => Ok(None),
        }
    }

    async fn requeue_stale(&self, stale_before: Timestamp) -> WardenResult<u64> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE warden_outbox \
             SET status = 'pending', locked_by = NULL, locked_at = NULL \
             WHERE status = 'publishing' AND locked_at < $1",
            &[&stale_before],
        )
        .await
        .map_err(|e| backend(e).into())
    }

    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> WardenResult<Vec<OutboxRecord>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM warden_outbox WHERE status = $1 ORDER BY id LIMIT $2"
        );
        let rows = conn
            .query(sql.as_str(), &[&status.as_db_str(), &(limit as i64)])
            .await
            .map_err(backend)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn replay(&self, id: OutboxId) -> WardenResult<bool> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE warden_outbox \
                 SET status = 'pending', deliver_attempts = 0 \
                 WHERE id = $1 AND status = 'error'",
                &[&id],
            )
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn get(&self, id: OutboxId) -> WardenResult<Option<OutboxRecord>> {
        let conn = self.get_conn().await?;
        let sql = format!("SELECT {COLUMNS} FROM warden_outbox WHERE id = $1");
        let row = conn
            .query_opt(sql.as_str(), &[&id])
            .await
            .map_err(backend)?;
        row.as_ref().map(record_from_row).transpose()
    }
}
