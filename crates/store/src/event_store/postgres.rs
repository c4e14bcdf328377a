//! Postgres-backed event store.
//!
//! Append inserts the log row and its outbox row in a single transaction,
//! drawing `global_seq` from the single-row `log_head` table so sequence
//! numbers follow commit order with no gaps. Claims hold their rows under
//! `FOR UPDATE SKIP LOCKED` for the lifetime of the claim's transaction;
//! dropping a claim rolls the transaction back and releases the rows.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | Scenario | EventStoreError |
//! |----------|----------|-----------------|
//! | `23505` on `event_log_idempotency` | duplicate idempotency key | `DuplicateIdempotencyKey` |
//! | `23505` (other) | concurrent head update conflict | `Storage` |
//! | `23503` | outbox row without log row | `Storage` |
//! | other | network/pool failures | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use mnx_core::{Scope, WorldId, payload_hash};
use mnx_events::{AppendReceipt, By, EventEnvelope, EventRecord};

use crate::retry::RetryPolicy;

use super::r#trait::{
    DlqEntry, EventStore, EventStoreError, OutboxClaim, OutboxEntry, RetryDisposition, ScopeLag,
    hash_event_lines,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply the versioned DDL. Services call this at startup and exit non-zero
/// on failure.
pub async fn run_migrations(pool: &PgPool) -> Result<(), EventStoreError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| EventStoreError::Storage(format!("migration failed: {e}")))
}

#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(format!("sqlx error in {operation}: {err}"))
}

fn is_idempotency_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return db_err
                .constraint()
                .map(|c| c == "event_log_idempotency")
                .unwrap_or(false);
        }
    }
    false
}

fn record_from_row(row: &PgRow) -> Result<EventRecord, sqlx::Error> {
    let world_id: Uuid = row.try_get("world_id")?;
    let occurred_at: Option<DateTime<Utc>> = row.try_get("occurred_at")?;
    let envelope_version: i32 = row.try_get("envelope_version")?;
    let global_seq: i64 = row.try_get("global_seq")?;

    Ok(EventRecord {
        event_id: row.try_get("event_id")?,
        global_seq: global_seq as u64,
        received_at: row.try_get("received_at")?,
        payload_hash: row.try_get("payload_hash")?,
        envelope: EventEnvelope {
            world_id: WorldId::from_uuid(world_id),
            branch: row.try_get("branch")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            by: By {
                agent: row.try_get("agent")?,
            },
            occurred_at,
            version: envelope_version as u32,
            idempotency_key: row.try_get("idempotency_key")?,
        },
    })
}

const RECORD_COLUMNS: &str = "e.global_seq, e.event_id, e.world_id, e.branch, e.kind, e.payload, \
     e.agent, e.occurred_at, e.envelope_version, e.idempotency_key, e.payload_hash, e.received_at";

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, envelope), fields(world_id = %envelope.world_id, branch = %envelope.branch, kind = %envelope.kind), err)]
    async fn append(&self, envelope: EventEnvelope) -> Result<AppendReceipt, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_append", e))?;

        // Serialized head update: commit order == sequence order, no gaps.
        let head = sqlx::query("UPDATE log_head SET next_seq = next_seq + 1 RETURNING next_seq")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_log_head", e))?;
        let global_seq: i64 = head
            .try_get("next_seq")
            .map_err(|e| map_sqlx_error("read_log_head", e))?;

        let event_id = Uuid::new_v4();
        let received_at = Utc::now();
        let hash = payload_hash(&envelope.payload);

        let insert = sqlx::query(
            r#"
            INSERT INTO event_log (
                global_seq, event_id, world_id, branch, kind, payload,
                agent, occurred_at, envelope_version, idempotency_key,
                payload_hash, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(global_seq)
        .bind(event_id)
        .bind(envelope.world_id.as_uuid())
        .bind(&envelope.branch)
        .bind(&envelope.kind)
        .bind(&envelope.payload)
        .bind(&envelope.by.agent)
        .bind(envelope.occurred_at)
        .bind(envelope.version as i32)
        .bind(&envelope.idempotency_key)
        .bind(&hash)
        .bind(received_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            let duplicate = is_idempotency_violation(&err);
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_append", e))?;

            if duplicate {
                let key = envelope.idempotency_key.clone().unwrap_or_default();
                let existing = sqlx::query(
                    "SELECT event_id FROM event_log \
                     WHERE world_id = $1 AND branch = $2 AND idempotency_key = $3",
                )
                .bind(envelope.world_id.as_uuid())
                .bind(&envelope.branch)
                .bind(&key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("lookup_existing_idempotent", e))?;

                let existing_event_id: Uuid = existing
                    .try_get("event_id")
                    .map_err(|e| map_sqlx_error("read_existing_idempotent", e))?;
                return Err(EventStoreError::DuplicateIdempotencyKey {
                    idempotency_key: key,
                    existing_event_id,
                });
            }
            return Err(map_sqlx_error("insert_event", err));
        }

        sqlx::query("INSERT INTO outbox (global_seq) VALUES ($1)")
            .bind(global_seq)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_append", e))?;

        Ok(AppendReceipt {
            event_id,
            global_seq: global_seq as u64,
            received_at,
        })
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventRecord>, EventStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM event_log e WHERE e.event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event", e))?;

        row.map(|r| record_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_event", e))
    }

    async fn read_range(
        &self,
        scope: &Scope,
        from_seq: u64,
        limit: u32,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM event_log e \
             WHERE e.world_id = $1 AND e.branch = $2 AND e.global_seq >= $3 \
             ORDER BY e.global_seq ASC LIMIT $4"
        ))
        .bind(scope.world_id.as_uuid())
        .bind(&scope.branch)
        .bind(from_seq as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_range", e))?;

        rows.iter()
            .map(|r| record_from_row(r))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("decode_range", e))
    }

    async fn latest_seq(&self) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_seq), 0) AS latest FROM event_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_seq", e))?;
        let latest: i64 = row
            .try_get("latest")
            .map_err(|e| map_sqlx_error("read_latest_seq", e))?;
        Ok(latest as u64)
    }

    #[instrument(skip(self), err)]
    async fn claim_unpublished(
        &self,
        limit: u32,
    ) -> Result<Box<dyn OutboxClaim>, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_claim", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS}, o.processing_attempts, o.last_error, o.next_retry_at \
             FROM outbox o JOIN event_log e USING (global_seq) \
             WHERE o.published_at IS NULL \
               AND (o.next_retry_at IS NULL OR o.next_retry_at <= now()) \
             ORDER BY o.global_seq ASC \
             LIMIT $1 \
             FOR UPDATE OF o SKIP LOCKED"
        ))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_unpublished", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let attempts: i32 = row
                .try_get("processing_attempts")
                .map_err(|e| map_sqlx_error("decode_claim", e))?;
            entries.push(OutboxEntry {
                record: record_from_row(row).map_err(|e| map_sqlx_error("decode_claim", e))?,
                processing_attempts: attempts as u32,
                last_error: row
                    .try_get("last_error")
                    .map_err(|e| map_sqlx_error("decode_claim", e))?,
                next_retry_at: row
                    .try_get("next_retry_at")
                    .map_err(|e| map_sqlx_error("decode_claim", e))?,
            });
        }

        Ok(Box::new(PostgresClaim {
            tx,
            entries,
            policy: self.policy.clone(),
        }))
    }

    async fn outbox_lag(&self) -> Result<Vec<ScopeLag>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT e.world_id, e.branch, \
                    EXTRACT(EPOCH FROM (now() - MIN(e.received_at)))::float8 AS lag_seconds \
             FROM outbox o JOIN event_log e USING (global_seq) \
             WHERE o.published_at IS NULL \
             GROUP BY e.world_id, e.branch",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_lag", e))?;

        let mut lags = Vec::with_capacity(rows.len());
        for row in rows {
            let world_id: Uuid = row
                .try_get("world_id")
                .map_err(|e| map_sqlx_error("decode_lag", e))?;
            let branch: String = row
                .try_get("branch")
                .map_err(|e| map_sqlx_error("decode_lag", e))?;
            let lag_seconds: f64 = row
                .try_get("lag_seconds")
                .map_err(|e| map_sqlx_error("decode_lag", e))?;
            lags.push(ScopeLag {
                scope: Scope::new(WorldId::from_uuid(world_id), branch),
                lag_seconds,
            });
        }
        Ok(lags)
    }

    async fn dlq_entries(&self, limit: u32) -> Result<Vec<DlqEntry>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT original_global_seq, reason, poisoned_by, failed_at \
             FROM dead_letter_queue ORDER BY original_global_seq ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_entries", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row
                .try_get("original_global_seq")
                .map_err(|e| map_sqlx_error("decode_dlq", e))?;
            entries.push(DlqEntry {
                original_global_seq: seq as u64,
                reason: row
                    .try_get("reason")
                    .map_err(|e| map_sqlx_error("decode_dlq", e))?,
                poisoned_by: row
                    .try_get("poisoned_by")
                    .map_err(|e| map_sqlx_error("decode_dlq", e))?,
                failed_at: row
                    .try_get("failed_at")
                    .map_err(|e| map_sqlx_error("decode_dlq", e))?,
            });
        }
        Ok(entries)
    }

    async fn determinism_hash(
        &self,
        scope: &Scope,
        start_seq: u64,
        end_seq: u64,
    ) -> Result<String, EventStoreError> {
        let rows = sqlx::query(
            "SELECT global_seq, event_id, kind, payload_hash FROM event_log \
             WHERE world_id = $1 AND branch = $2 AND global_seq BETWEEN $3 AND $4 \
             ORDER BY global_seq ASC",
        )
        .bind(scope.world_id.as_uuid())
        .bind(&scope.branch)
        .bind(start_seq as i64)
        .bind(end_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("determinism_hash", e))?;

        let mut lines: Vec<(u64, Uuid, String, String)> = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row
                .try_get("global_seq")
                .map_err(|e| map_sqlx_error("decode_hash_row", e))?;
            lines.push((
                seq as u64,
                row.try_get("event_id")
                    .map_err(|e| map_sqlx_error("decode_hash_row", e))?,
                row.try_get("kind")
                    .map_err(|e| map_sqlx_error("decode_hash_row", e))?,
                row.try_get("payload_hash")
                    .map_err(|e| map_sqlx_error("decode_hash_row", e))?,
            ));
        }

        Ok(hash_event_lines(
            lines
                .iter()
                .map(|(seq, id, kind, hash)| (*seq, id, kind.as_str(), hash.as_str())),
        ))
    }
}

/// A batch held open under `FOR UPDATE SKIP LOCKED`.
///
/// Dropping the claim drops the transaction, which rolls back any staged
/// updates and releases the row locks.
struct PostgresClaim {
    tx: Transaction<'static, Postgres>,
    entries: Vec<OutboxEntry>,
    policy: RetryPolicy,
}

impl PostgresClaim {
    fn entry(&self, global_seq: u64) -> Result<&OutboxEntry, EventStoreError> {
        self.entries
            .iter()
            .find(|e| e.record.global_seq == global_seq)
            .ok_or_else(|| {
                EventStoreError::InvalidState(format!(
                    "global_seq {global_seq} is not part of this claim"
                ))
            })
    }
}

#[async_trait]
impl OutboxClaim for PostgresClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_published(&mut self, global_seq: u64) -> Result<(), EventStoreError> {
        self.entry(global_seq)?;
        sqlx::query(
            "UPDATE outbox SET published_at = COALESCE(published_at, now()), \
                    next_retry_at = NULL, last_error = NULL \
             WHERE global_seq = $1",
        )
        .bind(global_seq as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }

    async fn mark_retry(
        &mut self,
        global_seq: u64,
        error: &str,
    ) -> Result<RetryDisposition, EventStoreError> {
        let attempts = self.entry(global_seq)?.processing_attempts + 1;

        let disposition = if self.policy.is_retryable(attempts) {
            let next = Utc::now()
                + chrono::Duration::from_std(self.policy.delay_for(attempts))
                    .unwrap_or_else(|_| chrono::Duration::seconds(3600));
            RetryDisposition::Retryable { next_retry_at: next }
        } else {
            RetryDisposition::Exhausted
        };
        let next_retry_at = match &disposition {
            RetryDisposition::Retryable { next_retry_at } => Some(*next_retry_at),
            RetryDisposition::Exhausted => None,
        };

        let result = sqlx::query(
            "UPDATE outbox SET processing_attempts = $2, last_error = $3, next_retry_at = $4 \
             WHERE global_seq = $1 AND published_at IS NULL",
        )
        .bind(global_seq as i64)
        .bind(attempts as i32)
        .bind(error)
        .bind(next_retry_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::InvalidState(format!(
                "cannot retry already-published event {global_seq}"
            )));
        }
        Ok(disposition)
    }

    async fn move_to_dlq(
        &mut self,
        global_seq: u64,
        reason: &str,
        poisoned_by: &str,
    ) -> Result<(), EventStoreError> {
        self.entry(global_seq)?;
        sqlx::query(
            "INSERT INTO dead_letter_queue (original_global_seq, reason, poisoned_by) \
             VALUES ($1, $2, $3) ON CONFLICT (original_global_seq) DO NOTHING",
        )
        .bind(global_seq as i64)
        .bind(reason)
        .bind(poisoned_by)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dlq", e))?;

        sqlx::query("DELETE FROM outbox WHERE global_seq = $1")
            .bind(global_seq as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_outbox_for_dlq", e))?;
        Ok(())
    }

    async fn complete(self: Box<Self>) -> Result<(), EventStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_claim", e))
    }
}
