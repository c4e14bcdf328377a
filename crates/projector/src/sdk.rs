//! The projector runtime core shared by every lens.
//!
//! Per delivery:
//! 1. verify `payload_hash` against the re-canonicalized payload (integrity);
//! 2. skip if the watermark already covers the sequence (idempotent replay);
//! 3. apply to the lens (UPSERT semantics, so replays converge);
//! 4. hash the lens's canonical snapshot and CAS-advance the watermark.
//!
//! A failure anywhere leaves the lens and watermark unchanged; the publisher
//! retries. Rebuild truncates the scope, resets the watermark, and
//! re-consumes the log from `global_seq = 0`; an identical event prefix must
//! reproduce an identical determinism hash.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use mnx_core::{Scope, payload_hash, sha256_hex};
use mnx_events::Delivery;
use mnx_store::{EventStore, WatermarkStore, WatermarkStoreError};

#[derive(Debug, Error)]
pub enum LensError {
    #[error("failed to deserialize payload for kind '{kind}': {detail}")]
    Deserialize { kind: String, detail: String },

    #[error("lens state error: {0}")]
    State(String),

    #[error("emit failed: {0}")]
    Emit(String),
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    /// Payload bytes do not hash to the delivery's `payload_hash`.
    #[error("payload hash mismatch for event {event_id}: expected {expected}, computed {computed}")]
    Integrity {
        event_id: Uuid,
        expected: String,
        computed: String,
    },

    #[error(transparent)]
    Lens(#[from] LensError),

    #[error("watermark error: {0}")]
    Watermark(String),

    #[error("replay error: {0}")]
    Replay(String),
}

impl From<WatermarkStoreError> for ProjectorError {
    fn from(err: WatermarkStoreError) -> Self {
        ProjectorError::Watermark(err.to_string())
    }
}

/// What happened to a delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    /// Sequence already covered by the watermark; lens untouched.
    Duplicate,
}

/// A materialized view over the event stream.
///
/// Implementations must be idempotent (UPSERT keyed on natural identity) and
/// must ignore kinds they do not handle; the watermark still advances past
/// them. `snapshot` returns the canonical per-scope state string: sorted
/// rows, stable field order, no locally-assigned timestamps.
#[async_trait]
pub trait Lens: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, delivery: &Delivery) -> Result<(), LensError>;

    async fn snapshot(&self, scope: &Scope) -> Result<String, LensError>;

    /// Drop all rows for the scope (rebuild path).
    async fn truncate(&self, scope: &Scope) -> Result<(), LensError>;

    /// Full state export for operator snapshots; `restore` must round-trip it.
    async fn export(&self, scope: &Scope) -> Result<serde_json::Value, LensError>;

    /// Replace the scope's state with a previously exported payload.
    async fn restore(&self, scope: &Scope, state: &serde_json::Value) -> Result<(), LensError>;
}

/// Admin snapshot: watermark + determinism hash + exported state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub projector: String,
    pub scope: Scope,
    pub last_processed_seq: u64,
    pub determinism_hash: Option<String>,
    pub state: serde_json::Value,
}

/// Operator-provided payload for `restore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub last_processed_seq: u64,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub scope: Scope,
    pub events_replayed: u64,
    pub determinism_hash: Option<String>,
}

/// One projector instance: a lens plus the shared runtime machinery.
pub struct ProjectorCore {
    name: String,
    lens: Arc<dyn Lens>,
    watermarks: Arc<dyn WatermarkStore>,
}

impl ProjectorCore {
    pub fn new(
        name: impl Into<String>,
        lens: Arc<dyn Lens>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            name: name.into(),
            lens,
            watermarks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lens(&self) -> &Arc<dyn Lens> {
        &self.lens
    }

    pub fn watermarks(&self) -> &Arc<dyn WatermarkStore> {
        &self.watermarks
    }

    /// Apply one delivery end to end.
    #[instrument(skip(self, delivery), fields(projector = %self.name, global_seq = delivery.global_seq), err)]
    pub async fn handle_delivery(
        &self,
        delivery: &Delivery,
    ) -> Result<ApplyOutcome, ProjectorError> {
        let computed = payload_hash(&delivery.envelope.payload);
        if computed != delivery.payload_hash {
            warn!(event_id = %delivery.event_id, "payload hash mismatch");
            return Err(ProjectorError::Integrity {
                event_id: delivery.event_id,
                expected: delivery.payload_hash.clone(),
                computed,
            });
        }

        let scope = delivery.scope();
        if let Some(wm) = self.watermarks.get(&self.name, &scope).await? {
            if delivery.global_seq <= wm.last_processed_seq {
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        self.lens.apply(delivery).await?;

        let state_hash = self.state_hash(&scope).await?;
        let advanced = self
            .watermarks
            .advance(&self.name, &scope, delivery.global_seq, &state_hash)
            .await?;

        Ok(if advanced {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Duplicate
        })
    }

    /// SHA-256 over the lens's canonical snapshot for the scope.
    pub async fn state_hash(&self, scope: &Scope) -> Result<String, ProjectorError> {
        let snapshot = self.lens.snapshot(scope).await?;
        Ok(sha256_hex(snapshot.as_bytes()))
    }

    /// Capture the current watermark, determinism hash, and exported state.
    pub async fn snapshot(&self, scope: &Scope) -> Result<SnapshotReport, ProjectorError> {
        let wm = self.watermarks.get(&self.name, scope).await?;
        Ok(SnapshotReport {
            projector: self.name.clone(),
            scope: scope.clone(),
            last_processed_seq: wm.as_ref().map(|w| w.last_processed_seq).unwrap_or(0),
            determinism_hash: wm.and_then(|w| w.determinism_hash),
            state: self.lens.export(scope).await?,
        })
    }

    /// Atomically set the lens to a prior snapshot and position the
    /// watermark accordingly.
    pub async fn restore(
        &self,
        scope: &Scope,
        request: &RestoreRequest,
    ) -> Result<(), ProjectorError> {
        self.lens.restore(scope, &request.state).await?;
        let state_hash = self.state_hash(scope).await?;
        self.watermarks.reset(&self.name, scope).await?;
        if request.last_processed_seq > 0 {
            self.watermarks
                .advance(&self.name, scope, request.last_processed_seq, &state_hash)
                .await?;
        }
        Ok(())
    }

    /// Truncate the scope, reset the watermark, and re-consume the log from
    /// `global_seq = 0` in order.
    pub async fn rebuild(
        &self,
        scope: &Scope,
        source: &dyn EventStore,
    ) -> Result<RebuildReport, ProjectorError> {
        const PAGE: u32 = 500;

        self.lens.truncate(scope).await?;
        self.watermarks.reset(&self.name, scope).await?;

        let mut replayed = 0u64;
        let mut from_seq = 0u64;
        loop {
            let page = source
                .read_range(scope, from_seq, PAGE)
                .await
                .map_err(|e| ProjectorError::Replay(e.to_string()))?;
            if page.is_empty() {
                break;
            }
            for record in &page {
                let delivery = record.to_delivery();
                self.handle_delivery(&delivery).await?;
                replayed += 1;
            }
            from_seq = page
                .last()
                .map(|r| r.global_seq + 1)
                .unwrap_or(from_seq + PAGE as u64);
        }

        let wm = self.watermarks.get(&self.name, scope).await?;
        info!(projector = %self.name, scope = %scope, replayed, "rebuild complete");
        Ok(RebuildReport {
            scope: scope.clone(),
            events_replayed: replayed,
            determinism_hash: wm.and_then(|w| w.determinism_hash),
        })
    }
}
