//! Event store contract: transactional append, outbox claims, DLQ, and the
//! determinism hash used for replay parity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use mnx_core::Scope;
use mnx_events::{AppendReceipt, EventEnvelope, EventRecord};

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The partial unique constraint on `(world_id, branch, idempotency_key)`
    /// was violated. Carries the row that already owns the key so the
    /// gateway can surface it on the 409.
    #[error("duplicate idempotency key '{idempotency_key}' (existing event {existing_event_id})")]
    DuplicateIdempotencyKey {
        idempotency_key: String,
        existing_event_id: Uuid,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted against a row in the wrong state
    /// (e.g. retrying an already-published event).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of `mark_retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Still within budget; the row becomes claimable again at the given time.
    Retryable { next_retry_at: DateTime<Utc> },
    /// Retry budget exhausted; the caller must quarantine the event.
    Exhausted,
}

/// An unpublished outbox row joined with its log record.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub record: EventRecord,
    pub processing_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// A quarantined event.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub original_global_seq: u64,
    pub reason: String,
    pub poisoned_by: String,
    pub failed_at: DateTime<Utc>,
}

/// Oldest-unpublished age per scope, for the lag gauge.
#[derive(Debug, Clone)]
pub struct ScopeLag {
    pub scope: Scope,
    pub lag_seconds: f64,
}

/// A batch of outbox rows claimed exclusively by one publisher worker.
///
/// The Postgres implementation holds the rows under `FOR UPDATE SKIP LOCKED`
/// for the lifetime of this object; the in-memory implementation holds
/// leases. Either way, dropping a claim without calling [`complete`]
/// releases the rows with none of the staged outcomes applied, the same
/// observable behavior as a rolled-back transaction, which is what makes
/// publisher shutdown deterministic.
///
/// [`complete`]: OutboxClaim::complete
#[async_trait]
pub trait OutboxClaim: Send {
    /// Claimed rows, ordered by `global_seq`.
    fn entries(&self) -> &[OutboxEntry];

    /// Record full acknowledgement. Idempotent.
    async fn mark_published(&mut self, global_seq: u64) -> Result<(), EventStoreError>;

    /// Record a failed delivery: bump attempts, store the error, schedule the
    /// next retry with store-computed backoff. Returns whether the event is
    /// still within its retry budget.
    async fn mark_retry(
        &mut self,
        global_seq: u64,
        error: &str,
    ) -> Result<RetryDisposition, EventStoreError>;

    /// Quarantine a poison event: insert the DLQ row and delete the outbox
    /// row together.
    async fn move_to_dlq(
        &mut self,
        global_seq: u64,
        reason: &str,
        poisoned_by: &str,
    ) -> Result<(), EventStoreError>;

    /// Commit every staged outcome and release the claim.
    async fn complete(self: Box<Self>) -> Result<(), EventStoreError>;
}

/// Append-only, tenant-scoped event log with a transactional outbox.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Validate-free append: the gateway validates envelopes before calling.
    ///
    /// Inserts the log row and its outbox row in one transaction, assigning
    /// `global_seq` in commit order (gap-free), `event_id`, `received_at`,
    /// and `payload_hash` over canonical JSON.
    async fn append(&self, envelope: EventEnvelope) -> Result<AppendReceipt, EventStoreError>;

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventRecord>, EventStoreError>;

    /// Events for one scope with `global_seq >= from_seq`, ordered, bounded.
    async fn read_range(
        &self,
        scope: &Scope,
        from_seq: u64,
        limit: u32,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Highest committed `global_seq` (0 when the log is empty).
    async fn latest_seq(&self) -> Result<u64, EventStoreError>;

    /// Claim the next unpublished, retry-due outbox rows in `global_seq`
    /// order. Concurrent claimants receive disjoint row sets.
    async fn claim_unpublished(
        &self,
        limit: u32,
    ) -> Result<Box<dyn OutboxClaim>, EventStoreError>;

    /// Oldest-unpublished lag per scope.
    async fn outbox_lag(&self) -> Result<Vec<ScopeLag>, EventStoreError>;

    async fn dlq_entries(&self, limit: u32) -> Result<Vec<DlqEntry>, EventStoreError>;

    /// SHA-256 over `global_seq|event_id|kind|payload_hash` lines for the
    /// scope's events in `[start_seq, end_seq]`, sorted by `global_seq`.
    /// Pure function of the log contents.
    async fn determinism_hash(
        &self,
        scope: &Scope,
        start_seq: u64,
        end_seq: u64,
    ) -> Result<String, EventStoreError>;
}

/// Shared line format for the determinism hash so both backends produce
/// identical bytes.
pub(crate) fn hash_event_lines<'a, I>(rows: I) -> String
where
    I: Iterator<Item = (u64, &'a Uuid, &'a str, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (global_seq, event_id, kind, payload_hash) in rows {
        hasher.update(format!("{global_seq}|{event_id}|{kind}|{payload_hash}\n").as_bytes());
    }
    hex::encode(hasher.finalize())
}
