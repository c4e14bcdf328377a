//! Memory-to-EMO translator.
//!
//! A projector that consumes legacy `memory.item.*` events and re-emits them
//! as `emo.*` events through the gateway ingest path. Identity, versioning,
//! and idempotency are preserved so the translated stream is observationally
//! equivalent to native `emo.*` ingest:
//!
//! - the `id` to `emo_id` mapping is total and deterministic (UUID parse, else UUIDv5 in a
//!   fixed namespace);
//! - the per-`emo_id` version counter lives in the translator's lens state
//!   and advances by exactly 1 per mutation;
//! - emitted envelopes carry the idempotency key
//!   `{emo_id}:{emo_version}:{op}`, so a re-emission after a crash resolves
//!   to a 409 at the gateway, which the translator treats as success.
//!
//! The emit happens before the state update: if the process dies in between,
//! re-delivery recomputes the same version from unchanged state, re-submits
//! the same idempotency key, and converges on the duplicate ack.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use mnx_core::{Scope, canonical_json};
use mnx_events::kinds;
use mnx_events::payloads::{MemoryItemDeleted, MemoryItemUpserted};
use mnx_events::{Delivery, EventEnvelope};
use mnx_store::{EventStore, EventStoreError};

use crate::sdk::{Lens, LensError};

/// Audit principal on translator-synthesized events.
pub const TRANSLATOR_AGENT: &str = "emo-translator";

/// Fixed namespace for deriving `emo_id` from non-UUID legacy item ids.
const EMO_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6d, 0x6e, 0x78, 0x2d, 0x65, 0x6d, 0x6f, 0x2d, 0x74, 0x72, 0x61, 0x6e, 0x73, 0x6c, 0x61,
    0x74,
]);

/// Map a legacy memory-item id to its EMO identity.
pub fn emo_id_for(item_id: &str) -> Uuid {
    item_id
        .parse::<Uuid>()
        .unwrap_or_else(|_| Uuid::new_v5(&EMO_ID_NAMESPACE, item_id.as_bytes()))
}

/// Translator-synthesized content: `title + "\n\n" + body`.
pub fn emo_content(title: &str, body: &str) -> String {
    format!("{title}\n\n{body}")
}

/// Whether an emitted envelope landed or was already present.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SinkAck {
    Accepted,
    /// The idempotency key already owns a log row; equivalent to success.
    Duplicate,
}

/// Where translated `emo.*` envelopes go: the gateway ingest path.
#[async_trait]
pub trait EmoSink: Send + Sync {
    async fn submit(&self, envelope: EventEnvelope) -> Result<SinkAck, LensError>;
}

/// Direct-append sink for colocated deployments and tests.
pub struct StoreEmoSink {
    store: Arc<dyn EventStore>,
}

impl StoreEmoSink {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EmoSink for StoreEmoSink {
    async fn submit(&self, envelope: EventEnvelope) -> Result<SinkAck, LensError> {
        match self.store.append(envelope).await {
            Ok(_) => Ok(SinkAck::Accepted),
            Err(EventStoreError::DuplicateIdempotencyKey { .. }) => Ok(SinkAck::Duplicate),
            Err(e) => Err(LensError::Emit(e.to_string())),
        }
    }
}

/// HTTP sink posting to the gateway's `POST /v1/events`.
pub struct HttpEmoSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmoSink {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl EmoSink for HttpEmoSink {
    async fn submit(&self, envelope: EventEnvelope) -> Result<SinkAck, LensError> {
        let response = self
            .client
            .post(format!("{}/v1/events", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| LensError::Emit(format!("gateway unreachable: {e}")))?;

        match response.status().as_u16() {
            201 => Ok(SinkAck::Accepted),
            409 => Ok(SinkAck::Duplicate),
            status => Err(LensError::Emit(format!(
                "gateway rejected translated event: {status}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ItemState {
    emo_id: Uuid,
    emo_version: u64,
    deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TranslatorState {
    items: BTreeMap<String, ItemState>,
}

pub struct TranslatorLens {
    sink: Arc<dyn EmoSink>,
    scopes: RwLock<HashMap<Scope, TranslatorState>>,
}

impl TranslatorLens {
    pub fn new(sink: Arc<dyn EmoSink>) -> Self {
        Self {
            sink,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Scope, TranslatorState>>, LensError> {
        self.scopes
            .read()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Scope, TranslatorState>>, LensError> {
        self.scopes
            .write()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    fn item(&self, scope: &Scope, item_id: &str) -> Result<Option<ItemState>, LensError> {
        Ok(self
            .read()?
            .get(scope)
            .and_then(|s| s.items.get(item_id))
            .cloned())
    }

    pub fn current_version(&self, scope: &Scope, item_id: &str) -> Option<u64> {
        self.item(scope, item_id).ok()?.map(|s| s.emo_version)
    }

    fn synthesized(
        &self,
        delivery: &Delivery,
        kind: &str,
        emo_id: Uuid,
        emo_version: u64,
        op: &str,
        payload: serde_json::Value,
    ) -> EventEnvelope {
        let mut envelope = EventEnvelope::new(
            delivery.envelope.world_id,
            delivery.envelope.branch.clone(),
            kind,
            payload,
            TRANSLATOR_AGENT,
        );
        envelope.occurred_at = delivery.envelope.occurred_at;
        envelope.idempotency_key = Some(format!("{emo_id}:{emo_version}:{op}"));
        envelope
    }
}

#[async_trait]
impl Lens for TranslatorLens {
    fn name(&self) -> &'static str {
        "emo-translator"
    }

    async fn apply(&self, delivery: &Delivery) -> Result<(), LensError> {
        let scope = delivery.scope();
        match delivery.envelope.kind.as_str() {
            kinds::MEMORY_ITEM_UPSERTED => {
                let payload: MemoryItemUpserted =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: delivery.envelope.kind.clone(),
                            detail: e.to_string(),
                        }
                    })?;

                let emo_id = emo_id_for(&payload.id);
                let current = self.item(&scope, &payload.id)?;
                let (emo_version, kind, op) = match &current {
                    None => (1, kinds::EMO_CREATED, "created"),
                    Some(state) => (state.emo_version + 1, kinds::EMO_UPDATED, "updated"),
                };

                let body = json!({
                    "emo_id": emo_id,
                    "emo_version": emo_version,
                    "content": emo_content(&payload.title, &payload.body),
                    "tags": payload.tags,
                    "source": payload.source,
                });
                let envelope = self.synthesized(delivery, kind, emo_id, emo_version, op, body);
                // Emit before updating state: a crash in between re-derives
                // the same version and resolves as a duplicate.
                self.sink.submit(envelope).await?;

                let mut map = self.write()?;
                map.entry(scope).or_default().items.insert(
                    payload.id,
                    ItemState {
                        emo_id,
                        emo_version,
                        deleted: false,
                    },
                );
            }
            kinds::MEMORY_ITEM_DELETED => {
                let payload: MemoryItemDeleted =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: delivery.envelope.kind.clone(),
                            detail: e.to_string(),
                        }
                    })?;

                let Some(current) = self.item(&scope, &payload.id)? else {
                    // Deletion of an item never sighted: nothing to translate.
                    return Ok(());
                };
                if current.deleted {
                    return Ok(());
                }

                let emo_version = current.emo_version + 1;
                let body = json!({
                    "emo_id": current.emo_id,
                    "emo_version": emo_version,
                });
                let envelope = self.synthesized(
                    delivery,
                    kinds::EMO_DELETED,
                    current.emo_id,
                    emo_version,
                    "deleted",
                    body,
                );
                self.sink.submit(envelope).await?;

                let mut map = self.write()?;
                map.entry(scope).or_default().items.insert(
                    payload.id,
                    ItemState {
                        emo_id: current.emo_id,
                        emo_version,
                        deleted: true,
                    },
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<String, LensError> {
        let map = self.read()?;
        let items: Vec<_> = map
            .get(scope)
            .map(|s| {
                s.items
                    .iter()
                    .map(|(id, st)| json!([id, st.emo_id, st.emo_version, st.deleted]))
                    .collect()
            })
            .unwrap_or_default();
        Ok(canonical_json(&json!({"items": items})))
    }

    async fn truncate(&self, scope: &Scope) -> Result<(), LensError> {
        self.write()?.remove(scope);
        Ok(())
    }

    async fn export(&self, scope: &Scope) -> Result<serde_json::Value, LensError> {
        let map = self.read()?;
        let state = map.get(scope).cloned().unwrap_or_default();
        serde_json::to_value(state).map_err(|e| LensError::State(e.to_string()))
    }

    async fn restore(&self, scope: &Scope, state: &serde_json::Value) -> Result<(), LensError> {
        let restored: TranslatorState =
            serde_json::from_value(state.clone()).map_err(|e| LensError::State(e.to_string()))?;
        self.write()?.insert(scope.clone(), restored);
        Ok(())
    }
}
