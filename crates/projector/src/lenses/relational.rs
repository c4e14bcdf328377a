//! Relational lens: notes, tags, links, and the EMO tables.
//!
//! Every handler is an UPSERT keyed on natural identity, so replay and
//! re-delivery converge. The snapshot concatenates all tables in a fixed
//! order with sorted rows; only fields that are pure functions of event
//! content participate (deletion timestamps are stored but excluded).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use mnx_core::{Scope, canonical_json, sha256_hex};
use mnx_events::kinds;
use mnx_events::payloads::{
    EmoDeletedPayload, EmoLinkedPayload, EmoPayload, LinkPayload, NotePayload, TagPayload,
};
use mnx_events::Delivery;

use crate::sdk::{Lens, LensError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRow {
    pub note_id: String,
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoRow {
    pub emo_id: Uuid,
    pub emo_version: u64,
    pub content: String,
    pub content_hash: String,
    pub tags: Vec<String>,
    pub deleted: bool,
    /// Set exactly when `deleted` is true; excluded from the snapshot.
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoHistoryRow {
    pub emo_id: Uuid,
    pub emo_version: u64,
    pub content_hash: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct RelationalState {
    notes: BTreeMap<String, NoteRow>,
    /// `(note_id, tag)`
    tags: BTreeSet<(String, String)>,
    /// `(src_id, dst_id, link_type)`
    links: BTreeSet<(String, String, String)>,
    emos: BTreeMap<Uuid, EmoRow>,
    /// Each `(emo_id, emo_version)` recorded once.
    emo_history: BTreeMap<(Uuid, u64), EmoHistoryRow>,
    /// `(source, target_or_uri, rel)`
    emo_links: BTreeSet<(Uuid, String, String)>,
}

/// Flat wire form of [`RelationalState`] for operator snapshot export and
/// restore (JSON object keys must be strings, so the keyed maps flatten to
/// row lists).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RelationalStateDump {
    notes: Vec<NoteRow>,
    tags: Vec<(String, String)>,
    links: Vec<(String, String, String)>,
    emos: Vec<EmoRow>,
    emo_history: Vec<EmoHistoryRow>,
    emo_links: Vec<(Uuid, String, String)>,
}

impl From<&RelationalState> for RelationalStateDump {
    fn from(state: &RelationalState) -> Self {
        Self {
            notes: state.notes.values().cloned().collect(),
            tags: state.tags.iter().cloned().collect(),
            links: state.links.iter().cloned().collect(),
            emos: state.emos.values().cloned().collect(),
            emo_history: state.emo_history.values().cloned().collect(),
            emo_links: state.emo_links.iter().cloned().collect(),
        }
    }
}

impl From<RelationalStateDump> for RelationalState {
    fn from(dump: RelationalStateDump) -> Self {
        Self {
            notes: dump
                .notes
                .into_iter()
                .map(|n| (n.note_id.clone(), n))
                .collect(),
            tags: dump.tags.into_iter().collect(),
            links: dump.links.into_iter().collect(),
            emos: dump.emos.into_iter().map(|e| (e.emo_id, e)).collect(),
            emo_history: dump
                .emo_history
                .into_iter()
                .map(|h| ((h.emo_id, h.emo_version), h))
                .collect(),
            emo_links: dump.emo_links.into_iter().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RelationalLens {
    scopes: RwLock<HashMap<Scope, RelationalState>>,
}

impl RelationalLens {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Scope, RelationalState>>, LensError> {
        self.scopes
            .read()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Scope, RelationalState>>, LensError> {
        self.scopes
            .write()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    pub fn note(&self, scope: &Scope, note_id: &str) -> Option<NoteRow> {
        self.read().ok()?.get(scope)?.notes.get(note_id).cloned()
    }

    pub fn note_tags(&self, scope: &Scope, note_id: &str) -> Vec<String> {
        self.read()
            .ok()
            .and_then(|map| {
                map.get(scope).map(|s| {
                    s.tags
                        .iter()
                        .filter(|(id, _)| id == note_id)
                        .map(|(_, tag)| tag.clone())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    pub fn emo(&self, scope: &Scope, emo_id: Uuid) -> Option<EmoRow> {
        self.read().ok()?.get(scope)?.emos.get(&emo_id).cloned()
    }

    pub fn emo_history(&self, scope: &Scope, emo_id: Uuid) -> Vec<EmoHistoryRow> {
        self.read()
            .ok()
            .and_then(|map| {
                map.get(scope).map(|s| {
                    s.emo_history
                        .iter()
                        .filter(|((id, _), _)| *id == emo_id)
                        .map(|(_, row)| row.clone())
                        .collect()
                })
            })
            .unwrap_or_default()
    }
}

fn decode<T: serde::de::DeserializeOwned>(delivery: &Delivery) -> Result<T, LensError> {
    serde_json::from_value(delivery.envelope.payload.clone()).map_err(|e| LensError::Deserialize {
        kind: delivery.envelope.kind.clone(),
        detail: e.to_string(),
    })
}

fn apply_emo_upsert(
    state: &mut RelationalState,
    payload: EmoPayload,
) {
    let newer = state
        .emos
        .get(&payload.emo_id)
        .map(|row| payload.emo_version > row.emo_version)
        .unwrap_or(true);

    let content_hash = sha256_hex(payload.content.as_bytes());
    state
        .emo_history
        .entry((payload.emo_id, payload.emo_version))
        .or_insert(EmoHistoryRow {
            emo_id: payload.emo_id,
            emo_version: payload.emo_version,
            content_hash: content_hash.clone(),
            deleted: false,
        });

    for link in &payload.links {
        let target = link
            .target
            .map(|t| t.to_string())
            .or_else(|| link.uri.clone());
        if let Some(target) = target {
            state
                .emo_links
                .insert((payload.emo_id, target, link.rel.as_str().to_string()));
        }
    }

    if !newer {
        return;
    }

    let mut tags = payload.tags;
    tags.sort();
    tags.dedup();
    state.emos.insert(
        payload.emo_id,
        EmoRow {
            emo_id: payload.emo_id,
            emo_version: payload.emo_version,
            content: payload.content.clone(),
            content_hash,
            tags,
            deleted: false,
            deleted_at: None,
        },
    );
}

#[async_trait]
impl Lens for RelationalLens {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn apply(&self, delivery: &Delivery) -> Result<(), LensError> {
        let scope = delivery.scope();
        let kind = delivery.envelope.kind.as_str();

        // Decode before taking the write lock so a malformed payload leaves
        // the lens untouched.
        match kind {
            kinds::NOTE_CREATED | kinds::NOTE_UPDATED => {
                let payload: NotePayload = decode(delivery)?;
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();
                let row = state.notes.entry(payload.id.clone()).or_insert(NoteRow {
                    note_id: payload.id.clone(),
                    title: None,
                    body: None,
                });
                if payload.title.is_some() {
                    row.title = payload.title;
                }
                if payload.body.is_some() {
                    row.body = payload.body;
                }
            }
            kinds::TAG_ADDED => {
                let payload: TagPayload = decode(delivery)?;
                let mut map = self.write()?;
                map.entry(scope)
                    .or_default()
                    .tags
                    .insert((payload.id, payload.tag));
            }
            kinds::TAG_REMOVED => {
                let payload: TagPayload = decode(delivery)?;
                let mut map = self.write()?;
                map.entry(scope)
                    .or_default()
                    .tags
                    .remove(&(payload.id, payload.tag));
            }
            kinds::LINK_ADDED => {
                let payload: LinkPayload = decode(delivery)?;
                let mut map = self.write()?;
                map.entry(scope).or_default().links.insert((
                    payload.src_id,
                    payload.dst_id,
                    payload.link_type,
                ));
            }
            kinds::LINK_REMOVED => {
                let payload: LinkPayload = decode(delivery)?;
                let mut map = self.write()?;
                map.entry(scope).or_default().links.remove(&(
                    payload.src_id,
                    payload.dst_id,
                    payload.link_type,
                ));
            }
            kinds::EMO_CREATED | kinds::EMO_UPDATED => {
                let payload: EmoPayload = decode(delivery)?;
                let mut map = self.write()?;
                apply_emo_upsert(map.entry(scope).or_default(), payload);
            }
            kinds::EMO_DELETED => {
                let payload: EmoDeletedPayload = decode(delivery)?;
                let deleted_at = delivery.envelope.occurred_at.unwrap_or_else(Utc::now);
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();

                if let Some(row) = state.emos.get_mut(&payload.emo_id) {
                    if payload.emo_version > row.emo_version {
                        row.emo_version = payload.emo_version;
                        row.deleted = true;
                        row.deleted_at = Some(deleted_at);
                        let content_hash = row.content_hash.clone();
                        state
                            .emo_history
                            .entry((payload.emo_id, payload.emo_version))
                            .or_insert(EmoHistoryRow {
                                emo_id: payload.emo_id,
                                emo_version: payload.emo_version,
                                content_hash,
                                deleted: true,
                            });
                    }
                }
            }
            kinds::EMO_LINKED => {
                let payload: EmoLinkedPayload = decode(delivery)?;
                let target = payload.target.map(|t| t.to_string()).or(payload.uri);
                if let Some(target) = target {
                    let mut map = self.write()?;
                    map.entry(scope).or_default().emo_links.insert((
                        payload.emo_id,
                        target,
                        payload.rel.as_str().to_string(),
                    ));
                }
            }
            // Kinds this lens does not materialize.
            _ => {}
        }
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<String, LensError> {
        let map = self.read()?;
        let state = map.get(scope).cloned().unwrap_or_default();

        let notes: Vec<_> = state
            .notes
            .values()
            .map(|n| json!({"note_id": n.note_id, "title": n.title, "body": n.body}))
            .collect();
        let tags: Vec<_> = state
            .tags
            .iter()
            .map(|(id, tag)| json!([id, tag]))
            .collect();
        let links: Vec<_> = state
            .links
            .iter()
            .map(|(src, dst, ty)| json!([src, dst, ty]))
            .collect();
        let emos: Vec<_> = state
            .emos
            .values()
            .map(|e| {
                json!({
                    "emo_id": e.emo_id,
                    "emo_version": e.emo_version,
                    "content_hash": e.content_hash,
                    "tags": e.tags,
                    "deleted": e.deleted,
                })
            })
            .collect();
        let emo_links: Vec<_> = state
            .emo_links
            .iter()
            .map(|(src, target, rel)| json!([src, target, rel]))
            .collect();

        Ok(canonical_json(&json!({
            "notes": notes,
            "tags": tags,
            "links": links,
            "emos": emos,
            "emo_links": emo_links,
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
            .map(RelationalStateDump::from)
            .unwrap_or_default();
        serde_json::to_value(dump).map_err(|e| LensError::State(e.to_string()))
    }

    async fn restore(&self, scope: &Scope, state: &serde_json::Value) -> Result<(), LensError> {
        let dump: RelationalStateDump =
            serde_json::from_value(state.clone()).map_err(|e| LensError::State(e.to_string()))?;
        self.write()?.insert(scope.clone(), dump.into());
        Ok(())
    }
}
