//! Typed payload bodies for the kinds the lenses materialize.
//!
//! Payloads travel as JSON objects; these structs are the deserialization
//! targets inside lens handlers. Unknown payload fields are ignored so
//! envelope payloads can grow without breaking older projectors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `note.created` / `note.updated`. Updates may carry partial fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// `tag.added` / `tag.removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPayload {
    pub id: String,
    pub tag: String,
}

/// `link.added` / `link.removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPayload {
    pub src_id: String,
    pub dst_id: String,
    pub link_type: String,
}

/// Relation kinds an EMO link may carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmoRel {
    Derived,
    Supersedes,
    Merges,
}

impl EmoRel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmoRel::Derived => "derived",
            EmoRel::Supersedes => "supersedes",
            EmoRel::Merges => "merges",
        }
    }
}

/// A link from one EMO to either another EMO or an external URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoLink {
    pub rel: EmoRel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// `emo.created` / `emo.updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoPayload {
    pub emo_id: Uuid,
    /// Strictly increasing per `emo_id`; 1 on creation.
    pub emo_version: u64,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub links: Vec<EmoLink>,
}

/// `emo.deleted`. Deletion is a versioned mutation, not an erasure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoDeletedPayload {
    pub emo_id: Uuid,
    pub emo_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `emo.linked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoLinkedPayload {
    pub emo_id: Uuid,
    pub rel: EmoRel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// `memory.item.upserted` (legacy ingest surface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItemUpserted {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// `memory.item.deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItemDeleted {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emo_payload_tolerates_missing_optionals() {
        let p: EmoPayload = serde_json::from_value(json!({
            "emo_id": "550e8400-e29b-41d4-a716-446655440000",
            "emo_version": 1,
            "content": "hello"
        }))
        .unwrap();
        assert!(p.tags.is_empty());
        assert!(p.links.is_empty());
        assert!(p.source.is_none());
    }

    #[test]
    fn emo_rel_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(EmoRel::Supersedes).unwrap(),
            json!("supersedes")
        );
    }
}
