//! Graph lens: per-scope graph of note/EMO nodes and typed edges.
//!
//! Edge creation is an UPSERT into an adjacency set; node deletion is soft so
//! edges survive for audit. Supersedes/merges chains may form cycles, which
//! is why cycle detection is a bounded-depth diagnostic query, never an
//! eagerly materialized closure.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use mnx_core::{Scope, canonical_json};
use mnx_events::kinds;
use mnx_events::payloads::{
    EmoDeletedPayload, EmoLinkedPayload, EmoPayload, EmoRel, LinkPayload, NotePayload, TagPayload,
};
use mnx_events::Delivery;

use crate::sdk::{Lens, LensError};

pub const EDGE_SUPERSEDED_BY: &str = "SUPERSEDED_BY";
pub const EDGE_DERIVES_FROM: &str = "DERIVES_FROM";
pub const EDGE_MERGES_INTO: &str = "MERGES_INTO";
pub const EDGE_LINKS_TO: &str = "LINKS_TO";
pub const EDGE_TAGGED: &str = "TAGGED";

/// Deterministic graph name for a scope. Pure function of its inputs.
pub fn graph_name(scope: &Scope) -> String {
    let branch: String = scope
        .branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("mnx_{}_{}", scope.world_id.as_uuid().simple(), branch)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    pub node_kind: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphState {
    nodes: BTreeMap<String, NodeRow>,
    /// `(src, edge_type, dst)`
    edges: BTreeSet<(String, String, String)>,
}

impl GraphState {
    fn ensure_node(&mut self, id: &str, node_kind: &str) {
        self.nodes.entry(id.to_string()).or_insert(NodeRow {
            id: id.to_string(),
            node_kind: node_kind.to_string(),
            deleted: false,
        });
    }

    fn add_edge(&mut self, src: &str, edge_type: &str, dst: &str) {
        self.edges
            .insert((src.to_string(), edge_type.to_string(), dst.to_string()));
    }
}

fn emo_node(emo_id: Uuid) -> String {
    format!("emo:{emo_id}")
}

fn note_node(id: &str) -> String {
    format!("note:{id}")
}

fn tag_node(tag: &str) -> String {
    format!("tag:{tag}")
}

fn emo_link_edge(state: &mut GraphState, source: Uuid, rel: EmoRel, target: Option<Uuid>, uri: Option<String>) {
    let src = emo_node(source);
    let dst = match (target, uri) {
        (Some(target), _) => {
            let node = emo_node(target);
            state.ensure_node(&node, "emo");
            node
        }
        (None, Some(uri)) => {
            state.ensure_node(&uri, "uri");
            uri
        }
        (None, None) => return,
    };
    match rel {
        // A supersedes B: B carries the SUPERSEDED_BY edge pointing at A.
        EmoRel::Supersedes => state.add_edge(&dst, EDGE_SUPERSEDED_BY, &src),
        EmoRel::Derived => state.add_edge(&src, EDGE_DERIVES_FROM, &dst),
        EmoRel::Merges => state.add_edge(&src, EDGE_MERGES_INTO, &dst),
    }
}

#[derive(Debug, Default)]
pub struct GraphLens {
    scopes: RwLock<HashMap<Scope, GraphState>>,
}

impl GraphLens {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Scope, GraphState>>, LensError> {
        self.scopes
            .read()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Scope, GraphState>>, LensError> {
        self.scopes
            .write()
            .map_err(|_| LensError::State("lock poisoned".to_string()))
    }

    pub fn node(&self, scope: &Scope, id: &str) -> Option<NodeRow> {
        self.read().ok()?.get(scope)?.nodes.get(id).cloned()
    }

    pub fn edge_count(&self, scope: &Scope) -> usize {
        self.read()
            .ok()
            .and_then(|map| map.get(scope).map(|s| s.edges.len()))
            .unwrap_or(0)
    }

    pub fn edges_from(&self, scope: &Scope, src: &str) -> Vec<(String, String)> {
        self.read()
            .ok()
            .and_then(|map| {
                map.get(scope).map(|s| {
                    s.edges
                        .iter()
                        .filter(|(from, _, _)| from == src)
                        .map(|(_, ty, dst)| (ty.clone(), dst.clone()))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    /// Bounded-depth cycle probe for admin diagnostics: returns one cycle
    /// through `start` if any exists within `max_depth` hops.
    pub fn find_cycle(
        &self,
        scope: &Scope,
        start: &str,
        max_depth: usize,
    ) -> Result<Option<Vec<String>>, LensError> {
        let map = self.read()?;
        let Some(state) = map.get(scope) else {
            return Ok(None);
        };

        let mut stack = vec![start.to_string()];
        if let Some(cycle) = dfs_cycle(state, start, &mut stack, max_depth) {
            return Ok(Some(cycle));
        }
        Ok(None)
    }
}

fn dfs_cycle(
    state: &GraphState,
    current: &str,
    stack: &mut Vec<String>,
    remaining: usize,
) -> Option<Vec<String>> {
    if remaining == 0 {
        return None;
    }
    for (_, _, dst) in state
        .edges
        .iter()
        .filter(|(src, _, _)| src == current)
    {
        if dst == &stack[0] {
            let mut cycle = stack.clone();
            cycle.push(dst.clone());
            return Some(cycle);
        }
        if stack.contains(dst) {
            continue;
        }
        stack.push(dst.clone());
        if let Some(cycle) = dfs_cycle(state, dst, stack, remaining - 1) {
            return Some(cycle);
        }
        stack.pop();
    }
    None
}

#[async_trait]
impl Lens for GraphLens {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn apply(&self, delivery: &Delivery) -> Result<(), LensError> {
        let scope = delivery.scope();
        let kind = delivery.envelope.kind.as_str();

        let decode_err = |e: serde_json::Error| LensError::Deserialize {
            kind: kind.to_string(),
            detail: e.to_string(),
        };

        match kind {
            kinds::NOTE_CREATED | kinds::NOTE_UPDATED => {
                let payload: NotePayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                map.entry(scope)
                    .or_default()
                    .ensure_node(&note_node(&payload.id), "note");
            }
            kinds::TAG_ADDED => {
                let payload: TagPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();
                let src = note_node(&payload.id);
                let dst = tag_node(&payload.tag);
                state.ensure_node(&src, "note");
                state.ensure_node(&dst, "tag");
                state.add_edge(&src, EDGE_TAGGED, &dst);
            }
            kinds::TAG_REMOVED => {
                let payload: TagPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                if let Some(state) = map.get_mut(&scope) {
                    state.edges.remove(&(
                        note_node(&payload.id),
                        EDGE_TAGGED.to_string(),
                        tag_node(&payload.tag),
                    ));
                }
            }
            kinds::LINK_ADDED => {
                let payload: LinkPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();
                let src = note_node(&payload.src_id);
                let dst = note_node(&payload.dst_id);
                state.ensure_node(&src, "note");
                state.ensure_node(&dst, "note");
                state.add_edge(&src, EDGE_LINKS_TO, &dst);
            }
            kinds::LINK_REMOVED => {
                let payload: LinkPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                if let Some(state) = map.get_mut(&scope) {
                    state.edges.remove(&(
                        note_node(&payload.src_id),
                        EDGE_LINKS_TO.to_string(),
                        note_node(&payload.dst_id),
                    ));
                }
            }
            kinds::EMO_CREATED | kinds::EMO_UPDATED => {
                let payload: EmoPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();
                let node = emo_node(payload.emo_id);
                state.ensure_node(&node, "emo");
                // Re-creation after deletion resurrects the node.
                if let Some(row) = state.nodes.get_mut(&node) {
                    row.deleted = false;
                }
                for link in payload.links {
                    emo_link_edge(state, payload.emo_id, link.rel, link.target, link.uri);
                }
            }
            kinds::EMO_DELETED => {
                let payload: EmoDeletedPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                if let Some(state) = map.get_mut(&scope) {
                    if let Some(row) = state.nodes.get_mut(&emo_node(payload.emo_id)) {
                        row.deleted = true;
                    }
                }
            }
            kinds::EMO_LINKED => {
                let payload: EmoLinkedPayload =
                    serde_json::from_value(delivery.envelope.payload.clone()).map_err(decode_err)?;
                let mut map = self.write()?;
                let state = map.entry(scope).or_default();
                state.ensure_node(&emo_node(payload.emo_id), "emo");
                emo_link_edge(state, payload.emo_id, payload.rel, payload.target, payload.uri);
            }
            _ => {}
        }
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<String, LensError> {
        let map = self.read()?;
        let state = map.get(scope).cloned().unwrap_or_default();

        let nodes: Vec<_> = state
            .nodes
            .values()
            .map(|n| json!({"id": n.id, "node_kind": n.node_kind, "deleted": n.deleted}))
            .collect();
        let edges: Vec<_> = state
            .edges
            .iter()
            .map(|(src, ty, dst)| json!([src, ty, dst]))
            .collect();

        Ok(canonical_json(&json!({
            "graph": graph_name(scope),
            "nodes": nodes,
            "edges": edges,
        })))
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
        let restored: GraphState =
            serde_json::from_value(state.clone()).map_err(|e| LensError::State(e.to_string()))?;
        self.write()?.insert(scope.clone(), restored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnx_core::{WorldId, payload_hash};
    use mnx_events::EventEnvelope;

    fn delivery(scope: &Scope, seq: u64, kind: &str, payload: serde_json::Value) -> Delivery {
        let envelope = EventEnvelope::new(scope.world_id, scope.branch.clone(), kind, payload, "t");
        Delivery {
            global_seq: seq,
            event_id: Uuid::new_v4(),
            payload_hash: payload_hash(&envelope.payload),
            envelope,
        }
    }

    fn scope() -> Scope {
        Scope::new(WorldId::new(), "main")
    }

    #[tokio::test]
    async fn graph_name_is_deterministic_and_sanitized() {
        let s = Scope::new(WorldId::new(), "feature/x");
        assert_eq!(graph_name(&s), graph_name(&s));
        assert!(graph_name(&s).ends_with("feature_x"));
    }

    #[tokio::test]
    async fn tagged_and_linked_edges_upsert() {
        let lens = GraphLens::new();
        let scope = scope();

        for _ in 0..2 {
            lens.apply(&delivery(&scope, 1, kinds::TAG_ADDED, json!({"id": "n1", "tag": "x"})))
                .await
                .unwrap();
        }
        assert_eq!(lens.edge_count(&scope), 1);

        lens.apply(&delivery(
            &scope,
            2,
            kinds::LINK_ADDED,
            json!({"src_id": "n1", "dst_id": "n2", "link_type": "ref"}),
        ))
        .await
        .unwrap();
        let edges = lens.edges_from(&scope, "note:n1");
        assert!(edges.contains(&(EDGE_TAGGED.to_string(), "tag:x".to_string())));
        assert!(edges.contains(&(EDGE_LINKS_TO.to_string(), "note:n2".to_string())));
    }

    #[tokio::test]
    async fn supersedes_edge_points_from_old_to_new() {
        let lens = GraphLens::new();
        let scope = scope();
        let new = Uuid::new_v4();
        let old = Uuid::new_v4();

        lens.apply(&delivery(
            &scope,
            1,
            kinds::EMO_CREATED,
            json!({
                "emo_id": new,
                "emo_version": 1,
                "content": "x",
                "links": [{"rel": "supersedes", "target": old}]
            }),
        ))
        .await
        .unwrap();

        let edges = lens.edges_from(&scope, &format!("emo:{old}"));
        assert_eq!(edges, vec![(EDGE_SUPERSEDED_BY.to_string(), format!("emo:{new}"))]);
    }

    #[tokio::test]
    async fn deletion_is_soft_and_preserves_edges() {
        let lens = GraphLens::new();
        let scope = scope();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        lens.apply(&delivery(
            &scope,
            1,
            kinds::EMO_CREATED,
            json!({
                "emo_id": a,
                "emo_version": 1,
                "content": "x",
                "links": [{"rel": "derived", "target": b}]
            }),
        ))
        .await
        .unwrap();
        lens.apply(&delivery(
            &scope,
            2,
            kinds::EMO_DELETED,
            json!({"emo_id": a, "emo_version": 2}),
        ))
        .await
        .unwrap();

        let node = lens.node(&scope, &format!("emo:{a}")).unwrap();
        assert!(node.deleted);
        assert_eq!(lens.edge_count(&scope), 1);
    }

    #[tokio::test]
    async fn cycle_detection_is_depth_bounded() {
        let lens = GraphLens::new();
        let scope = scope();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        // a -> b -> c -> a through MERGES_INTO edges.
        for (src, dst) in [(a, b), (b, c), (c, a)] {
            lens.apply(&delivery(
                &scope,
                1,
                kinds::EMO_LINKED,
                json!({"emo_id": src, "rel": "merges", "target": dst}),
            ))
            .await
            .unwrap();
        }

        let start = format!("emo:{a}");
        let cycle = lens.find_cycle(&scope, &start, 5).unwrap().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        // Too small a depth bound finds nothing.
        assert!(lens.find_cycle(&scope, &start, 2).unwrap().is_none());
    }
}
