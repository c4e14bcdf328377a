//! Semantic lens: embeddings for similarity retrieval.
//!
//! One row per `(entity_id, entity_type, template_id, model_id)`. Raw vector
//! values are allowed to vary across model runtimes, so the determinism hash
//! covers model identity `(model_id, model_version, template_id)` plus the
//! sorted set of `(entity_id, entity_type, emo_version)`, never the vector
//! bytes. This is the documented replay-parity contract for this lens.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mnx_core::{Scope, canonical_json};
use mnx_events::kinds;
use mnx_events::payloads::{EmoDeletedPayload, EmoPayload, NotePayload, TagPayload};
use mnx_events::Delivery;

use crate::embedding::SharedEmbedder;
use crate::sdk::{Lens, LensError};

/// Template set identifier carried in configuration and the snapshot.
pub const DEFAULT_TEMPLATE_ID: &str = "mnx.v1";

const NOTE_TEMPLATES: [&str; 3] = ["title", "body", "combined"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct EmbeddingKey {
    entity_id: String,
    entity_type: String,
    template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EmbeddingRow {
    emo_version: u64,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
struct SemanticState {
    rows: BTreeMap<EmbeddingKey, EmbeddingRow>,
    /// Current note text, merged across partial updates, so re-embedding a
    /// note after `note.updated` sees the full document.
    note_text: BTreeMap<String, (Option<String>, Option<String>)>,
}

/// Flat wire form for export/restore (struct keys flatten to entry lists).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SemanticStateDump {
    rows: Vec<(EmbeddingKey, EmbeddingRow)>,
    note_text: Vec<(String, (Option<String>, Option<String>))>,
}

impl From<&SemanticState> for SemanticStateDump {
    fn from(state: &SemanticState) -> Self {
        Self {
            rows: state
                .rows
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            note_text: state
                .note_text
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl From<SemanticStateDump> for SemanticState {
    fn from(dump: SemanticStateDump) -> Self {
        Self {
            rows: dump.rows.into_iter().collect(),
            note_text: dump.note_text.into_iter().collect(),
        }
    }
}

pub struct SemanticLens {
    template_id: String,
    embedder: SharedEmbedder,
    scopes: RwLock<HashMap<Scope, SemanticState>>,
}

impl SemanticLens {
    pub fn new(embedder: SharedEmbedder) -> Self {
        Self::with_template(embedder, DEFAULT_TEMPLATE_ID)
    }

    pub fn with_template(embedder: SharedEmbedder, template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            embedder,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Scope, SemanticState>>, LensError> {
        self.scopes
            .read()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Scope, SemanticState>>, LensError> {
        self.scopes
            .write()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    pub fn embedding_count(&self, scope: &Scope) -> usize {
        self.read()
            .ok()
            .and_then(|map| map.get(scope).map(|s| s.rows.len()))
            .unwrap_or(0)
    }

    /// Cosine similarity search over one entity type (admin/query surface).
    pub async fn similar(
        &self,
        scope: &Scope,
        entity_type: &str,
        template: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, LensError> {
        let query_vec = self.embedder.embed(template, query).await?;
        let map = self.read()?;
        let Some(state) = map.get(scope) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(String, f32)> = state
            .rows
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type && key.template == template)
            .map(|(key, row)| (key.entity_id.clone(), cosine(&query_vec, &row.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn embed_note(
        &self,
        scope: &Scope,
        note_id: &str,
        title: Option<String>,
        body: Option<String>,
    ) -> Result<(), LensError> {
        // Merge partial updates against the retained text.
        let (title, body) = {
            let mut map = self.write()?;
            let state = map.entry(scope.clone()).or_default();
            let entry = state
                .note_text
                .entry(note_id.to_string())
                .or_insert((None, None));
            if title.is_some() {
                entry.0 = title;
            }
            if body.is_some() {
                entry.1 = body;
            }
            entry.clone()
        };

        let title_text = title.unwrap_or_default();
        let body_text = body.unwrap_or_default();
        let combined = format!("{title_text}\n\n{body_text}");

        for (template, text) in NOTE_TEMPLATES
            .iter()
            .zip([&title_text, &body_text, &combined])
        {
            let vector = self.embedder.embed(template, text).await?;
            let mut map = self.write()?;
            map.entry(scope.clone()).or_default().rows.insert(
                EmbeddingKey {
                    entity_id: note_id.to_string(),
                    entity_type: "note".to_string(),
                    template: template.to_string(),
                },
                EmbeddingRow {
                    emo_version: 0,
                    vector,
                },
            );
        }
        Ok(())
    }

    fn purge_entity(&self, scope: &Scope, entity_id: &str, entity_type: &str) -> Result<(), LensError> {
        let mut map = self.write()?;
        if let Some(state) = map.get_mut(scope) {
            state
                .rows
                .retain(|key, _| !(key.entity_id == entity_id && key.entity_type == entity_type));
            if entity_type == "note" {
                state.note_text.remove(entity_id);
            }
        }
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl Lens for SemanticLens {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn apply(&self, delivery: &Delivery) -> Result<(), LensError> {
        let scope = delivery.scope();
        let kind = delivery.envelope.kind.as_str();

        match kind {
            kinds::NOTE_CREATED | kinds::NOTE_UPDATED => {
                let payload: NotePayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: kind.to_string(),
                            detail: e.to_string(),
                        }
                    })?;
                self.embed_note(&scope, &payload.id, payload.title, payload.body)
                    .await?;
            }
            kinds::EMO_CREATED | kinds::EMO_UPDATED => {
                let payload: EmoPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: kind.to_string(),
                            detail: e.to_string(),
                        }
                    })?;
                let vector = self.embedder.embed("content", &payload.content).await?;
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();
                let key = EmbeddingKey {
                    entity_id: payload.emo_id.to_string(),
                    entity_type: "emo".to_string(),
                    template: "content".to_string(),
                };
                // Stale versions must not clobber newer embeddings on replay.
                let stale = state
                    .rows
                    .get(&key)
                    .map(|row| payload.emo_version < row.emo_version)
                    .unwrap_or(false);
                if !stale {
                    state.rows.insert(
                        key,
                        EmbeddingRow {
                            emo_version: payload.emo_version,
                            vector,
                        },
                    );
                }
            }
            kinds::EMO_DELETED => {
                let payload: EmoDeletedPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: kind.to_string(),
                            detail: e.to_string(),
                        }
                    })?;
                self.purge_entity(&scope, &payload.emo_id.to_string(), "emo")?;
            }
            kinds::TAG_ADDED => {
                let payload: TagPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: kind.to_string(),
                            detail: e.to_string(),
                        }
                    })?;
                let text = format!("tag:{}", payload.tag);
                let vector = self.embedder.embed("tag", &text).await?;
                let mut map = self.write()?;
                map.entry(scope).or_default().rows.insert(
                    EmbeddingKey {
                        entity_id: format!("{}/{}", payload.id, payload.tag),
                        entity_type: "tag".to_string(),
                        template: "tag".to_string(),
                    },
                    EmbeddingRow {
                        emo_version: 0,
                        vector,
                    },
                );
            }
            kinds::TAG_REMOVED => {
                let payload: TagPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| {
                        LensError::Deserialize {
                            kind: kind.to_string(),
                            detail: e.to_string(),
                        }
                    })?;
                self.purge_entity(&scope, &format!("{}/{}", payload.id, payload.tag), "tag")?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<String, LensError> {
        let map = self.read()?;
        let entries: Vec<_> = map
            .get(scope)
            .map(|state| {
                state
                    .rows
                    .keys()
                    .map(|key| {
                        let version = state.rows[key].emo_version;
                        json!([key.entity_id, key.entity_type, version])
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(canonical_json(&json!({
            "model": {
                "model_id": self.embedder.model_id(),
                "model_version": self.embedder.model_version(),
                "template_id": self.template_id,
            },
            "entries": entries,
        })))
    }

    async fn truncate(&self, scope: &Scope) -> Result<(), LensError> {
        self.write()?.remove(scope);
        Ok(())
    }

    async fn export(&self, scope: &Scope) -> Result<serde_json::Value, LensError> {
        let map = self.read()?;
        let dump = map
            .get(scope)
            .map(SemanticStateDump::from)
            .unwrap_or_default();
        serde_json::to_value(dump).map_err(|e| LensError::State(e.to_string()))
    }

    async fn restore(&self, scope: &Scope, state: &serde_json::Value) -> Result<(), LensError> {
        let dump: SemanticStateDump =
            serde_json::from_value(state.clone()).map_err(|e| LensError::State(e.to_string()))?;
        self.write()?.insert(scope.clone(), dump.into());
        Ok(())
    }
}
