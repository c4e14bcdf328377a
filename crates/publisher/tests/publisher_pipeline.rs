//! Publisher behavior against live HTTP subscribers: delivery + ack, the
//! all-subscribers-must-ack rule, retry-then-DLQ quarantine, and the full
//! outbox-to-projector spine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde_json::json;

use mnx_core::{Scope, WorldId};
use mnx_events::{Delivery, EventEnvelope, kinds};
use mnx_observability::MetricsRegistry;
use mnx_projector::lenses::RelationalLens;
use mnx_projector::receiver::{ProjectorRuntime, router as projector_router};
use mnx_projector::sdk::ProjectorCore;
use mnx_publisher::{Publisher, PublisherConfig, SubscriberEndpoint};
use mnx_store::{EventStore, InMemoryEventStore, InMemoryWatermarkStore, RetryPolicy, WatermarkStore};

#[derive(Clone)]
struct StubState {
    status: StatusCode,
    seen: Arc<Mutex<Vec<Delivery>>>,
}

async fn stub_receive(
    State(state): State<StubState>,
    Json(delivery): Json<Delivery>,
) -> StatusCode {
    state.seen.lock().unwrap().push(delivery);
    state.status
}

/// Spawn a subscriber stub on an ephemeral port; returns its delivery URL
/// and the deliveries it has seen.
async fn spawn_stub(status: StatusCode) -> (String, Arc<Mutex<Vec<Delivery>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/events", post(stub_receive))
        .with_state(StubState {
            status,
            seen: seen.clone(),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, seen)
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::ZERO,
        max_retries,
        cap: Duration::from_secs(3600),
        jitter: 0.0,
    }
}

fn publisher(
    store: Arc<InMemoryEventStore>,
    endpoints: Vec<SubscriberEndpoint>,
) -> (Publisher, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new());
    let config = PublisherConfig {
        publisher_id: "pub-test".to_string(),
        poll_interval: Duration::from_millis(10),
        batch_size: 50,
        endpoints,
        delivery_timeout: Duration::from_secs(2),
        worker_concurrency: 4,
    };
    (
        Publisher::new(store, config, metrics.clone()),
        metrics,
    )
}

async fn append_note(store: &InMemoryEventStore, scope: &Scope, id: &str) {
    store
        .append(EventEnvelope::new(
            scope.world_id,
            scope.branch.clone(),
            kinds::NOTE_CREATED,
            json!({"id": id, "title": id}),
            "t",
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn delivery_and_ack_marks_published() {
    let store = Arc::new(InMemoryEventStore::new(fast_policy(10)));
    let scope = Scope::new(WorldId::new(), "main");
    append_note(&store, &scope, "n1").await;

    let (url, seen) = spawn_stub(StatusCode::OK).await;
    let (publisher, metrics) = publisher(
        store.clone(),
        vec![SubscriberEndpoint {
            name: "echo".to_string(),
            url,
        }],
    );

    let handled = publisher.process_batch().await.unwrap();
    assert_eq!(handled, 1);
    assert_eq!(store.unpublished_count(), 0);
    assert_eq!(metrics.counter("events_published_total").get(), 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].global_seq, 1);
    assert_eq!(seen[0].envelope.kind, kinds::NOTE_CREATED);
}

#[tokio::test]
async fn accepted_202_counts_as_success() {
    let store = Arc::new(InMemoryEventStore::new(fast_policy(10)));
    let scope = Scope::new(WorldId::new(), "main");
    append_note(&store, &scope, "n1").await;

    let (url, _seen) = spawn_stub(StatusCode::ACCEPTED).await;
    let (publisher, _metrics) = publisher(
        store.clone(),
        vec![SubscriberEndpoint {
            name: "s".to_string(),
            url,
        }],
    );

    publisher.process_batch().await.unwrap();
    assert_eq!(store.unpublished_count(), 0);
}

#[tokio::test]
async fn all_subscribers_must_ack() {
    let store = Arc::new(InMemoryEventStore::new(fast_policy(10)));
    let scope = Scope::new(WorldId::new(), "main");
    append_note(&store, &scope, "n1").await;

    let (ok_url, ok_seen) = spawn_stub(StatusCode::OK).await;
    let (bad_url, _) = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR).await;
    let (publisher, metrics) = publisher(
        store.clone(),
        vec![
            SubscriberEndpoint {
                name: "healthy".to_string(),
                url: ok_url,
            },
            SubscriberEndpoint {
                name: "broken".to_string(),
                url: bad_url,
            },
        ],
    );

    publisher.process_batch().await.unwrap();
    // One subscriber failed: the row stays unpublished and is retried later.
    assert_eq!(store.unpublished_count(), 1);
    assert_eq!(metrics.counter("events_published_total").get(), 0);
    assert_eq!(
        metrics
            .counter_with("events_failed_total", &[("error_type", "http_500")])
            .get(),
        1
    );
    // The healthy subscriber did receive it (idempotent receivers required).
    assert_eq!(ok_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn poison_event_lands_in_dlq_after_retry_budget() {
    // max_retries = 1 with zero base delay: attempt 1 schedules a retry,
    // attempt 2 exhausts and quarantines.
    let store = Arc::new(InMemoryEventStore::new(fast_policy(1)));
    let scope = Scope::new(WorldId::new(), "main");
    append_note(&store, &scope, "poison").await;

    let (url, _) = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR).await;
    let (publisher, _metrics) = publisher(
        store.clone(),
        vec![SubscriberEndpoint {
            name: "broken".to_string(),
            url,
        }],
    );

    publisher.process_batch().await.unwrap();
    assert_eq!(store.unpublished_count(), 1);
    publisher.process_batch().await.unwrap();

    assert_eq!(store.unpublished_count(), 0, "poison row left the outbox");
    let dlq = store.dlq_entries(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].original_global_seq, 1);
    assert!(dlq[0].reason.contains("500"), "reason: {}", dlq[0].reason);
    assert_eq!(dlq[0].poisoned_by, "pub-test");
    // Lag drops once nothing is unpublished.
    assert!(store.outbox_lag().await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_is_delivered_in_global_seq_order() {
    let store = Arc::new(InMemoryEventStore::new(fast_policy(10)));
    let scope = Scope::new(WorldId::new(), "main");
    for i in 0..20 {
        append_note(&store, &scope, &format!("n{i}")).await;
    }

    let (url, seen) = spawn_stub(StatusCode::OK).await;
    // Single worker: strict per-subscriber ordering within the batch.
    let publisher = Publisher::new(
        store.clone(),
        PublisherConfig {
            publisher_id: "pub-ordered".to_string(),
            poll_interval: Duration::from_millis(10),
            batch_size: 50,
            endpoints: vec![SubscriberEndpoint {
                name: "echo".to_string(),
                url,
            }],
            delivery_timeout: Duration::from_secs(2),
            worker_concurrency: 1,
        },
        Arc::new(MetricsRegistry::new()),
    );

    publisher.process_batch().await.unwrap();
    let seqs: Vec<u64> = seen.lock().unwrap().iter().map(|d| d.global_seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert_eq!(seqs.len(), 20);
}

#[tokio::test]
async fn spine_end_to_end_through_projector_receiver() {
    // Gateway-side store with an outbox, a real projector receiver over
    // HTTP, and the publisher in between.
    let store = Arc::new(InMemoryEventStore::new(fast_policy(10)));
    let scope = Scope::new(WorldId::new(), "main");
    append_note(&store, &scope, "n1").await;

    let lens = Arc::new(RelationalLens::new());
    let watermarks = Arc::new(InMemoryWatermarkStore::new());
    let core = Arc::new(ProjectorCore::new("relational", lens.clone(), watermarks.clone()));
    let runtime = Arc::new(ProjectorRuntime::new(
        core.clone(),
        Arc::new(MetricsRegistry::new()),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events", listener.local_addr().unwrap());
    let app = projector_router(runtime);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (publisher, metrics) = publisher(
        store.clone(),
        vec![SubscriberEndpoint {
            name: "relational".to_string(),
            url,
        }],
    );
    publisher.process_batch().await.unwrap();

    assert_eq!(store.unpublished_count(), 0);
    assert_eq!(metrics.counter("events_published_total").get(), 1);

    let note = lens.note(&scope, "n1").expect("note materialized");
    assert_eq!(note.title.as_deref(), Some("n1"));
    let wm = watermarks.get("relational", &scope).await.unwrap().unwrap();
    assert_eq!(wm.last_processed_seq, 1);

    // Re-running the publisher with nothing unpublished is a no-op.
    assert_eq!(publisher.process_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn run_loop_drains_and_stops_on_shutdown() {
    let store = Arc::new(InMemoryEventStore::new(fast_policy(10)));
    let scope = Scope::new(WorldId::new(), "main");
    append_note(&store, &scope, "n1").await;

    let (url, _seen) = spawn_stub(StatusCode::OK).await;
    let (publisher, _metrics) = publisher(
        store.clone(),
        vec![SubscriberEndpoint {
            name: "echo".to_string(),
            url,
        }],
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let publisher = Arc::new(publisher);
    let run = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.run(shutdown_rx).await })
    };

    // Wait for the event to publish, then signal shutdown.
    for _ in 0..100 {
        if store.unpublished_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.unpublished_count(), 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run loop exits after shutdown")
        .unwrap();
}
