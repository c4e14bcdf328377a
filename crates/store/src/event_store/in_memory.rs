//! In-memory event store.
//!
//! Intended for tests/dev. Semantics mirror the Postgres backend exactly:
//! gap-free commit-order sequences, idempotency enforcement, lease-based
//! claims whose staged outcomes only apply on `complete` (an abandoned claim
//! behaves like a rolled-back transaction).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use mnx_core::{Scope, WorldId, payload_hash};
use mnx_events::{AppendReceipt, EventEnvelope, EventRecord};

use crate::retry::RetryPolicy;

use super::r#trait::{
    DlqEntry, EventStore, EventStoreError, OutboxClaim, OutboxEntry, RetryDisposition, ScopeLag,
    hash_event_lines,
};

#[derive(Debug, Clone)]
struct OutboxRow {
    published_at: Option<DateTime<Utc>>,
    processing_attempts: u32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Index `i` holds the record with `global_seq == i + 1`.
    records: Vec<EventRecord>,
    by_event_id: HashMap<Uuid, u64>,
    idempotency: HashMap<(WorldId, String, String), Uuid>,
    outbox: BTreeMap<u64, OutboxRow>,
    dlq: BTreeMap<u64, DlqEntry>,
    claimed: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    policy: RetryPolicy,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryEventStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            policy,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, EventStoreError> {
        self.inner
            .lock()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    /// Number of unpublished outbox rows (test/diagnostic helper).
    pub fn unpublished_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .outbox
                    .values()
                    .filter(|row| row.published_at.is_none())
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, envelope: EventEnvelope) -> Result<AppendReceipt, EventStoreError> {
        let mut inner = self.lock()?;

        if let Some(key) = &envelope.idempotency_key {
            let idem_key = (envelope.world_id, envelope.branch.clone(), key.clone());
            if let Some(existing) = inner.idempotency.get(&idem_key) {
                return Err(EventStoreError::DuplicateIdempotencyKey {
                    idempotency_key: key.clone(),
                    existing_event_id: *existing,
                });
            }
        }

        let global_seq = inner.records.len() as u64 + 1;
        let event_id = Uuid::new_v4();
        let received_at = Utc::now();
        let record = EventRecord {
            event_id,
            global_seq,
            received_at,
            payload_hash: payload_hash(&envelope.payload),
            envelope,
        };

        if let Some(key) = &record.envelope.idempotency_key {
            inner.idempotency.insert(
                (record.envelope.world_id, record.envelope.branch.clone(), key.clone()),
                event_id,
            );
        }
        inner.by_event_id.insert(event_id, global_seq);
        inner.outbox.insert(
            global_seq,
            OutboxRow {
                published_at: None,
                processing_attempts: 0,
                last_error: None,
                next_retry_at: None,
            },
        );
        inner.records.push(record);

        Ok(AppendReceipt {
            event_id,
            global_seq,
            received_at,
        })
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventRecord>, EventStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .by_event_id
            .get(&event_id)
            .and_then(|seq| inner.records.get(*seq as usize - 1))
            .cloned())
    }

    async fn read_range(
        &self,
        scope: &Scope,
        from_seq: u64,
        limit: u32,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.global_seq >= from_seq && r.scope() == *scope)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn latest_seq(&self) -> Result<u64, EventStoreError> {
        Ok(self.lock()?.records.len() as u64)
    }

    async fn claim_unpublished(
        &self,
        limit: u32,
    ) -> Result<Box<dyn OutboxClaim>, EventStoreError> {
        let now = Utc::now();
        let mut inner = self.lock()?;

        let seqs: Vec<u64> = inner
            .outbox
            .iter()
            .filter(|(seq, row)| {
                row.published_at.is_none()
                    && row.next_retry_at.map(|at| at <= now).unwrap_or(true)
                    && !inner.claimed.contains(seq)
            })
            .take(limit as usize)
            .map(|(seq, _)| *seq)
            .collect();

        let mut entries = Vec::with_capacity(seqs.len());
        for seq in &seqs {
            inner.claimed.insert(*seq);
            let row = &inner.outbox[seq];
            entries.push(OutboxEntry {
                record: inner.records[*seq as usize - 1].clone(),
                processing_attempts: row.processing_attempts,
                last_error: row.last_error.clone(),
                next_retry_at: row.next_retry_at,
            });
        }

        Ok(Box::new(InMemoryClaim {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
            entries,
            staged: Vec::new(),
            completed: false,
        }))
    }

    async fn outbox_lag(&self) -> Result<Vec<ScopeLag>, EventStoreError> {
        let now = Utc::now();
        let inner = self.lock()?;
        let mut oldest: BTreeMap<Scope, DateTime<Utc>> = BTreeMap::new();
        for (seq, row) in &inner.outbox {
            if row.published_at.is_some() {
                continue;
            }
            let record = &inner.records[*seq as usize - 1];
            let entry = oldest.entry(record.scope()).or_insert(record.received_at);
            if record.received_at < *entry {
                *entry = record.received_at;
            }
        }
        Ok(oldest
            .into_iter()
            .map(|(scope, received_at)| ScopeLag {
                scope,
                lag_seconds: (now - received_at).num_milliseconds().max(0) as f64 / 1000.0,
            })
            .collect())
    }

    async fn dlq_entries(&self, limit: u32) -> Result<Vec<DlqEntry>, EventStoreError> {
        let inner = self.lock()?;
        Ok(inner.dlq.values().take(limit as usize).cloned().collect())
    }

    async fn determinism_hash(
        &self,
        scope: &Scope,
        start_seq: u64,
        end_seq: u64,
    ) -> Result<String, EventStoreError> {
        let inner = self.lock()?;
        Ok(hash_event_lines(
            inner
                .records
                .iter()
                .filter(|r| {
                    r.global_seq >= start_seq && r.global_seq <= end_seq && r.scope() == *scope
                })
                .map(|r| {
                    (
                        r.global_seq,
                        &r.event_id,
                        r.envelope.kind.as_str(),
                        r.payload_hash.as_str(),
                    )
                }),
        ))
    }
}

#[derive(Debug)]
enum StagedOp {
    Published(u64),
    Retry {
        global_seq: u64,
        attempts: u32,
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
    },
    Dlq {
        global_seq: u64,
        reason: String,
        poisoned_by: String,
    },
}

struct InMemoryClaim {
    inner: Arc<Mutex<Inner>>,
    policy: RetryPolicy,
    entries: Vec<OutboxEntry>,
    staged: Vec<StagedOp>,
    completed: bool,
}

impl InMemoryClaim {
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

    fn release(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            for entry in &self.entries {
                inner.claimed.remove(&entry.record.global_seq);
            }
        }
    }
}

#[async_trait]
impl OutboxClaim for InMemoryClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_published(&mut self, global_seq: u64) -> Result<(), EventStoreError> {
        self.entry(global_seq)?;
        self.staged.push(StagedOp::Published(global_seq));
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
        self.staged.push(StagedOp::Retry {
            global_seq,
            attempts,
            error: error.to_string(),
            next_retry_at,
        });
        Ok(disposition)
    }

    async fn move_to_dlq(
        &mut self,
        global_seq: u64,
        reason: &str,
        poisoned_by: &str,
    ) -> Result<(), EventStoreError> {
        self.entry(global_seq)?;
        self.staged.push(StagedOp::Dlq {
            global_seq,
            reason: reason.to_string(),
            poisoned_by: poisoned_by.to_string(),
        });
        Ok(())
    }

    async fn complete(mut self: Box<Self>) -> Result<(), EventStoreError> {
        let staged = std::mem::take(&mut self.staged);
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
            for op in staged {
                match op {
                    StagedOp::Published(seq) => {
                        if let Some(row) = inner.outbox.get_mut(&seq) {
                            if row.published_at.is_none() {
                                row.published_at = Some(Utc::now());
                            }
                            row.next_retry_at = None;
                            row.last_error = None;
                        }
                    }
                    StagedOp::Retry {
                        global_seq,
                        attempts,
                        error,
                        next_retry_at,
                    } => {
                        if let Some(row) = inner.outbox.get_mut(&global_seq) {
                            if row.published_at.is_some() {
                                return Err(EventStoreError::InvalidState(format!(
                                    "cannot retry already-published event {global_seq}"
                                )));
                            }
                            row.processing_attempts = attempts;
                            row.last_error = Some(error);
                            row.next_retry_at = next_retry_at;
                        }
                    }
                    StagedOp::Dlq {
                        global_seq,
                        reason,
                        poisoned_by,
                    } => {
                        inner.outbox.remove(&global_seq);
                        inner.dlq.insert(
                            global_seq,
                            DlqEntry {
                                original_global_seq: global_seq,
                                reason,
                                poisoned_by,
                                failed_at: Utc::now(),
                            },
                        );
                    }
                }
            }
        }
        self.completed = true;
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        // Abandoned claim: release leases, discard staged outcomes.
        if !self.completed {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemoryEventStore {
        InMemoryEventStore::new(RetryPolicy {
            base_delay: std::time::Duration::from_millis(10),
            max_retries: 2,
            cap: std::time::Duration::from_secs(3600),
            jitter: 0.0,
        })
    }

    fn envelope(scope: &Scope, kind: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(scope.world_id, scope.branch.clone(), kind, payload, "tester")
    }

    fn scope() -> Scope {
        Scope::new(WorldId::new(), "main")
    }

    #[tokio::test]
    async fn append_assigns_gap_free_commit_order() {
        let store = store();
        let scope = scope();
        for i in 0..5 {
            let receipt = store
                .append(envelope(&scope, "note.created", json!({"id": format!("n{i}")})))
                .await
                .unwrap();
            assert_eq!(receipt.global_seq, i + 1);
        }
        assert_eq!(store.latest_seq().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_conflicts_with_existing_event() {
        let store = store();
        let scope = scope();
        let env = envelope(&scope, "note.created", json!({"id": "n1"})).with_idempotency_key("k1");

        let first = store.append(env.clone()).await.unwrap();
        let err = store.append(env).await.unwrap_err();
        match err {
            EventStoreError::DuplicateIdempotencyKey {
                idempotency_key,
                existing_event_id,
            } => {
                assert_eq!(idempotency_key, "k1");
                assert_eq!(existing_event_id, first.event_id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.latest_seq().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_key_in_different_branches_is_allowed() {
        let store = store();
        let world = WorldId::new();
        let a = EventEnvelope::new(world, "main", "note.created", json!({"id": "n1"}), "t")
            .with_idempotency_key("k1");
        let b = EventEnvelope::new(world, "alt", "note.created", json!({"id": "n1"}), "t")
            .with_idempotency_key("k1");
        store.append(a).await.unwrap();
        store.append(b).await.unwrap();
        assert_eq!(store.latest_seq().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_claims_return_disjoint_rows() {
        let store = store();
        let scope = scope();
        for i in 0..6 {
            store
                .append(envelope(&scope, "note.created", json!({"id": format!("n{i}")})))
                .await
                .unwrap();
        }

        let claim_a = store.claim_unpublished(4).await.unwrap();
        let claim_b = store.claim_unpublished(4).await.unwrap();

        let seqs_a: Vec<u64> = claim_a.entries().iter().map(|e| e.record.global_seq).collect();
        let seqs_b: Vec<u64> = claim_b.entries().iter().map(|e| e.record.global_seq).collect();
        assert_eq!(seqs_a, vec![1, 2, 3, 4]);
        assert_eq!(seqs_b, vec![5, 6]);
    }

    #[tokio::test]
    async fn abandoned_claim_releases_rows_without_applying_outcomes() {
        let store = store();
        let scope = scope();
        store
            .append(envelope(&scope, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();

        {
            let mut claim = store.claim_unpublished(10).await.unwrap();
            claim.mark_published(1).await.unwrap();
            // Dropped without complete(): simulated crash.
        }

        let claim = store.claim_unpublished(10).await.unwrap();
        assert_eq!(claim.entries().len(), 1, "row must be claimable again");
        assert_eq!(store.unpublished_count(), 1);
    }

    #[tokio::test]
    async fn published_rows_leave_the_claimable_set() {
        let store = store();
        let scope = scope();
        store
            .append(envelope(&scope, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();

        let mut claim = store.claim_unpublished(10).await.unwrap();
        claim.mark_published(1).await.unwrap();
        claim.complete().await.unwrap();

        assert_eq!(store.unpublished_count(), 0);
        let claim = store.claim_unpublished(10).await.unwrap();
        assert!(claim.entries().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_reports_not_retryable() {
        let store = store();
        let scope = scope();
        store
            .append(envelope(&scope, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();

        // max_retries = 2: attempts 1 and 2 retry, attempt 3 exhausts.
        for attempt in 1..=2 {
            let mut claim = store.claim_unpublished(10).await.unwrap();
            assert_eq!(claim.entries().len(), 1, "attempt {attempt}");
            let disposition = claim.mark_retry(1, "subscriber returned 500").await.unwrap();
            assert!(matches!(disposition, RetryDisposition::Retryable { .. }));
            claim.complete().await.unwrap();
            // Wait out the backoff so the row is claimable again.
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        }

        let mut claim = store.claim_unpublished(10).await.unwrap();
        let disposition = claim.mark_retry(1, "subscriber returned 500").await.unwrap();
        assert_eq!(disposition, RetryDisposition::Exhausted);
        claim
            .move_to_dlq(1, "max retries exceeded: subscriber returned 500", "pub-1")
            .await
            .unwrap();
        claim.complete().await.unwrap();

        assert_eq!(store.unpublished_count(), 0);
        let dlq = store.dlq_entries(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].original_global_seq, 1);
        assert!(dlq[0].reason.contains("500"));
    }

    #[tokio::test]
    async fn backoff_delays_reclaim_until_due() {
        let store = InMemoryEventStore::new(RetryPolicy {
            base_delay: std::time::Duration::from_secs(30),
            max_retries: 5,
            cap: std::time::Duration::from_secs(3600),
            jitter: 0.0,
        });
        let scope = scope();
        store
            .append(envelope(&scope, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();

        let mut claim = store.claim_unpublished(10).await.unwrap();
        claim.mark_retry(1, "timeout").await.unwrap();
        claim.complete().await.unwrap();

        let claim = store.claim_unpublished(10).await.unwrap();
        assert!(claim.entries().is_empty(), "row must be deferred by backoff");
    }

    #[tokio::test]
    async fn determinism_hash_is_pure_and_scope_bound() {
        let store = store();
        let scope_a = scope();
        let scope_b = Scope::new(scope_a.world_id, "alt");

        store
            .append(envelope(&scope_a, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();
        store
            .append(envelope(&scope_b, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();
        store
            .append(envelope(&scope_a, "tag.added", json!({"id": "n1", "tag": "x"})))
            .await
            .unwrap();

        let h1 = store.determinism_hash(&scope_a, 0, 10).await.unwrap();
        let h2 = store.determinism_hash(&scope_a, 0, 10).await.unwrap();
        assert_eq!(h1, h2);

        let hb = store.determinism_hash(&scope_b, 0, 10).await.unwrap();
        assert_ne!(h1, hb);
    }

    #[tokio::test]
    async fn range_reads_are_scoped_and_ordered() {
        let store = store();
        let scope_a = scope();
        let scope_b = Scope::new(WorldId::new(), "main");
        for i in 0..4 {
            let s = if i % 2 == 0 { &scope_a } else { &scope_b };
            store
                .append(envelope(s, "note.created", json!({"id": format!("n{i}")})))
                .await
                .unwrap();
        }

        let rows = store.read_range(&scope_a, 0, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.windows(2).all(|w| w[0].global_seq < w[1].global_seq));
        assert!(rows.iter().all(|r| r.scope() == scope_a));
    }

    #[tokio::test]
    async fn outbox_lag_tracks_oldest_unpublished() {
        let store = store();
        let scope = scope();
        store
            .append(envelope(&scope, "note.created", json!({"id": "n1"})))
            .await
            .unwrap();

        let lags = store.outbox_lag().await.unwrap();
        assert_eq!(lags.len(), 1);
        assert_eq!(lags[0].scope, scope);
        assert!(lags[0].lag_seconds >= 0.0);

        let mut claim = store.claim_unpublished(10).await.unwrap();
        claim.mark_published(1).await.unwrap();
        claim.complete().await.unwrap();
        assert!(store.outbox_lag().await.unwrap().is_empty());
    }
}
