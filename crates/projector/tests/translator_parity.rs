//! Translator parity: a `memory.item.*` stream run through the translator
//! must leave the relational lens in the same state as the equivalent native
//! `emo.*` stream.

use std::sync::Arc;

use serde_json::json;

use mnx_core::{Scope, WorldId, sha256_hex};
use mnx_events::{EventEnvelope, kinds};
use mnx_projector::lenses::RelationalLens;
use mnx_projector::sdk::{Lens, ProjectorCore};
use mnx_projector::translator::{StoreEmoSink, TranslatorLens, emo_content, emo_id_for};
use mnx_store::{EventStore, InMemoryEventStore, InMemoryWatermarkStore, RetryPolicy};

async fn append(
    store: &InMemoryEventStore,
    scope: &Scope,
    kind: &str,
    payload: serde_json::Value,
) {
    store
        .append(EventEnvelope::new(
            scope.world_id,
            scope.branch.clone(),
            kind,
            payload,
            "t",
        ))
        .await
        .unwrap();
}

/// Run every event in the store through the given projector, in order.
async fn drive_all(core: &ProjectorCore, store: &InMemoryEventStore, scope: &Scope) {
    let mut from_seq = 0;
    loop {
        let records = store.read_range(scope, from_seq, 100).await.unwrap();
        if records.is_empty() {
            break;
        }
        for record in &records {
            core.handle_delivery(&record.to_delivery()).await.unwrap();
        }
        from_seq = records.last().unwrap().global_seq + 1;
    }
}

async fn relational_snapshot_hash(store: &InMemoryEventStore, scope: &Scope) -> String {
    let lens = Arc::new(RelationalLens::new());
    let core = ProjectorCore::new(
        "relational",
        lens.clone(),
        Arc::new(InMemoryWatermarkStore::new()),
    );
    drive_all(&core, store, scope).await;
    sha256_hex(lens.snapshot(scope).await.unwrap().as_bytes())
}

#[tokio::test]
async fn upsert_then_delete_matches_native_stream() {
    let world = WorldId::new();
    let scope = Scope::new(world, "main");
    let emo_id = emo_id_for("m1");

    // Stream A: legacy events, translated into emo.* through the store sink.
    let store_a = InMemoryEventStore::new(RetryPolicy::default());
    append(&store_a, &scope, kinds::MEMORY_ITEM_UPSERTED, json!({"id": "m1", "title": "T", "body": "B"}))
        .await;
    append(&store_a, &scope, kinds::MEMORY_ITEM_DELETED, json!({"id": "m1"})).await;

    let translator = ProjectorCore::new(
        "emo-translator",
        Arc::new(TranslatorLens::new(Arc::new(StoreEmoSink::new(Arc::new(
            store_a.clone(),
        ))))),
        Arc::new(InMemoryWatermarkStore::new()),
    );
    drive_all(&translator, &store_a, &scope).await;

    // The translator appended emo.created + emo.deleted behind the legacy rows.
    assert_eq!(store_a.latest_seq().await.unwrap(), 4);

    // Stream B: the equivalent native emo.* stream.
    let store_b = InMemoryEventStore::new(RetryPolicy::default());
    append(
        &store_b,
        &scope,
        kinds::EMO_CREATED,
        json!({
            "emo_id": emo_id,
            "emo_version": 1,
            "content": emo_content("T", "B"),
            "tags": [],
            "source": null,
        }),
    )
    .await;
    append(
        &store_b,
        &scope,
        kinds::EMO_DELETED,
        json!({"emo_id": emo_id, "emo_version": 2}),
    )
    .await;

    let hash_a = relational_snapshot_hash(&store_a, &scope).await;
    let hash_b = relational_snapshot_hash(&store_b, &scope).await;
    assert_eq!(hash_a, hash_b);
}

#[tokio::test]
async fn multi_item_history_matches_native_stream() {
    let world = WorldId::new();
    let scope = Scope::new(world, "main");

    let store_a = InMemoryEventStore::new(RetryPolicy::default());
    append(&store_a, &scope, kinds::MEMORY_ITEM_UPSERTED, json!({"id": "m1", "title": "A", "body": "1", "tags": ["x"]}))
        .await;
    append(&store_a, &scope, kinds::MEMORY_ITEM_UPSERTED, json!({"id": "m2", "title": "B", "body": "2"}))
        .await;
    append(&store_a, &scope, kinds::MEMORY_ITEM_UPSERTED, json!({"id": "m1", "title": "A", "body": "1b", "tags": ["x"]}))
        .await;

    let translator = ProjectorCore::new(
        "emo-translator",
        Arc::new(TranslatorLens::new(Arc::new(StoreEmoSink::new(Arc::new(
            store_a.clone(),
        ))))),
        Arc::new(InMemoryWatermarkStore::new()),
    );
    drive_all(&translator, &store_a, &scope).await;

    let store_b = InMemoryEventStore::new(RetryPolicy::default());
    append(
        &store_b,
        &scope,
        kinds::EMO_CREATED,
        json!({
            "emo_id": emo_id_for("m1"),
            "emo_version": 1,
            "content": emo_content("A", "1"),
            "tags": ["x"],
            "source": null,
        }),
    )
    .await;
    append(
        &store_b,
        &scope,
        kinds::EMO_CREATED,
        json!({
            "emo_id": emo_id_for("m2"),
            "emo_version": 1,
            "content": emo_content("B", "2"),
            "tags": [],
            "source": null,
        }),
    )
    .await;
    append(
        &store_b,
        &scope,
        kinds::EMO_UPDATED,
        json!({
            "emo_id": emo_id_for("m1"),
            "emo_version": 2,
            "content": emo_content("A", "1b"),
            "tags": ["x"],
            "source": null,
        }),
    )
    .await;

    assert_eq!(
        relational_snapshot_hash(&store_a, &scope).await,
        relational_snapshot_hash(&store_b, &scope).await
    );
}

#[tokio::test]
async fn translated_events_are_idempotent_at_the_store() {
    let world = WorldId::new();
    let scope = Scope::new(world, "main");

    let store = InMemoryEventStore::new(RetryPolicy::default());
    append(&store, &scope, kinds::MEMORY_ITEM_UPSERTED, json!({"id": "m1", "title": "T", "body": "B"}))
        .await;

    let lens = Arc::new(TranslatorLens::new(Arc::new(StoreEmoSink::new(Arc::new(
        store.clone(),
    )))));

    // Apply the same legacy record twice against a translator whose state
    // was lost in between (crash before the watermark advanced).
    let record = store.read_range(&scope, 0, 1).await.unwrap()[0].to_delivery();
    lens.apply(&record).await.unwrap();
    lens.truncate(&scope).await.unwrap();
    lens.apply(&record).await.unwrap();

    // Exactly one emo.created landed in the log.
    let records = store.read_range(&scope, 0, 100).await.unwrap();
    let created: Vec<_> = records
        .iter()
        .filter(|r| r.envelope.kind == kinds::EMO_CREATED)
        .collect();
    assert_eq!(created.len(), 1);
}
