//! Black-box tests against the real router on an ephemeral port.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::json;

use mnx_gateway::app::{AppServices, build_app, services::build_services};
use mnx_gateway::config::{ApiKeys, GatewayConfig};

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: GatewayConfig) -> Self {
        // Build the same router as prod, but bind to an ephemeral port.
        let services = Arc::new(build_services(&config).await);
        let app = build_app(services.clone(), &config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    async fn spawn_default() -> Self {
        Self::spawn(test_config()).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        api_keys: ApiKeys {
            admin: vec!["key-admin".to_string()],
            write: vec!["key-write".to_string()],
            read: vec!["key-read".to_string()],
        },
        ..GatewayConfig::default()
    }
}

const WORLD: &str = "550e8400-e29b-41d4-a716-446655440000";

fn note_envelope(id: &str) -> serde_json::Value {
    json!({
        "world_id": WORLD,
        "branch": "main",
        "kind": "note.created",
        "payload": {"id": id, "title": "hello"},
        "by": {"agent": "t"},
    })
}

#[tokio::test]
async fn auth_is_required_for_protected_endpoints() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Public liveness stays open.
    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn read_scope_cannot_write_and_write_cannot_admin() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-read")
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .get(format!("{}/v1/admin/health", srv.base_url))
        .bearer_auth("key-write")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn happy_append_assigns_seq_and_reads_back() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .header("X-Correlation-Id", "corr-1")
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["global_seq"], 1);
    let event_id = body["event_id"].as_str().unwrap();
    assert!(event_id.parse::<uuid::Uuid>().is_ok());
    assert!(body["received_at"].as_str().is_some());

    // Read by id (X-API-Key header form).
    let res = client
        .get(format!("{}/v1/events/{}", srv.base_url, event_id))
        .header("X-API-Key", "key-read")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: serde_json::Value = res.json().await.unwrap();
    assert_eq!(fetched["envelope"]["kind"], "note.created");
    assert_eq!(fetched["envelope"]["payload"]["id"], "n1");

    // Range read: one log row, one outbox row behind it.
    let res = client
        .get(format!(
            "{}/v1/events?world_id={}&branch=main&from_seq=0&limit=10",
            srv.base_url, WORLD
        ))
        .bearer_auth("key-read")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let range: serde_json::Value = res.json().await.unwrap();
    assert_eq!(range["count"], 1);
}

#[tokio::test]
async fn duplicate_idempotency_key_returns_conflict_with_existing_event() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .header("Idempotency-Key", "k1")
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: serde_json::Value = first.json().await.unwrap();

    let second = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .header("Idempotency-Key", "k1")
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let conflict: serde_json::Value = second.json().await.unwrap();
    assert_eq!(conflict["code"], "conflict");
    assert_eq!(conflict["idempotency_key"], "k1");
    assert_eq!(conflict["event_id"], first["event_id"]);

    // Exactly one log row exists.
    let res = client
        .get(format!(
            "{}/v1/events?world_id={}&branch=main",
            srv.base_url, WORLD
        ))
        .bearer_auth("key-read")
        .send()
        .await
        .unwrap();
    let range: serde_json::Value = res.json().await.unwrap();
    assert_eq!(range["count"], 1);
}

#[tokio::test]
async fn header_and_envelope_keys_must_agree() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let mut envelope = note_envelope("n1");
    envelope["idempotency_key"] = json!("body-key");

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .header("Idempotency-Key", "header-key")
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn invalid_envelopes_are_rejected_without_log_rows() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let cases = vec![
        // Malformed kind.
        json!({
            "world_id": WORLD, "branch": "main", "kind": "NotAKind",
            "payload": {}, "by": {"agent": "t"},
        }),
        // Missing agent.
        json!({
            "world_id": WORLD, "branch": "main", "kind": "note.created",
            "payload": {}, "by": {"agent": ""},
        }),
        // world_id not a UUID (serde rejects).
        json!({
            "world_id": "not-a-uuid", "branch": "main", "kind": "note.created",
            "payload": {}, "by": {"agent": "t"},
        }),
        // occurred_at too far in the future.
        json!({
            "world_id": WORLD, "branch": "main", "kind": "note.created",
            "payload": {}, "by": {"agent": "t"},
            "occurred_at": "2099-01-01T00:00:00Z",
        }),
    ];

    for case in cases {
        let res = client
            .post(format!("{}/v1/events", srv.base_url))
            .bearer_auth("key-write")
            .json(&case)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "case: {case}");
    }

    let res = client
        .get(format!(
            "{}/v1/events?world_id={}&branch=main",
            srv.base_url, WORLD
        ))
        .bearer_auth("key-read")
        .send()
        .await
        .unwrap();
    let range: serde_json::Value = res.json().await.unwrap();
    assert_eq!(range["count"], 0, "4xx must not produce log rows");
}

#[tokio::test]
async fn idempotency_required_kinds_reject_keyless_appends() {
    let config = GatewayConfig {
        idempotency_required_for_kinds: vec!["note.created".to_string()],
        ..test_config()
    };
    let srv = TestServer::spawn(config).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .header("Idempotency-Key", "k1")
        .json(&note_envelope("n1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn rate_limit_caps_requests_per_minute() {
    let config = GatewayConfig {
        rate_limit_per_minute: 2,
        ..test_config()
    };
    let srv = TestServer::spawn(config).await;
    let client = reqwest::Client::new();

    for i in 0..2 {
        let res = client
            .post(format!("{}/v1/events", srv.base_url))
            .bearer_auth("key-write")
            .json(&note_envelope(&format!("n{i}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let res = client
        .post(format!("{}/v1/events", srv.base_url))
        .bearer_auth("key-write")
        .json(&note_envelope("n3"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn branch_registry_lifecycle() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/branches", srv.base_url))
        .bearer_auth("key-write")
        .json(&json!({
            "world_id": WORLD,
            "branch": "experiment",
            "parent_branch": "main",
            "created_by": "tester",
            "metadata": {"purpose": "test"},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    // Duplicate registration conflicts.
    let res = client
        .post(format!("{}/v1/branches", srv.base_url))
        .bearer_auth("key-write")
        .json(&json!({"world_id": WORLD, "branch": "experiment"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // Unknown parent rejected.
    let res = client
        .post(format!("{}/v1/branches", srv.base_url))
        .bearer_auth("key-write")
        .json(&json!({"world_id": WORLD, "branch": "b2", "parent_branch": "ghost"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/v1/branches?world_id={}", srv.base_url, WORLD))
        .bearer_auth("key-read")
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["branches"].as_array().unwrap().len(), 1);

    let res = client
        .get(format!(
            "{}/v1/branches/experiment?world_id={}",
            srv.base_url, WORLD
        ))
        .bearer_auth("key-read")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let entry: serde_json::Value = res.json().await.unwrap();
    assert_eq!(entry["parent_branch"], "main");
}

#[tokio::test]
async fn admin_health_reports_seq_and_watermarks() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        client
            .post(format!("{}/v1/events", srv.base_url))
            .bearer_auth("key-write")
            .json(&note_envelope(&format!("n{i}")))
            .send()
            .await
            .unwrap();
    }

    let res = client
        .get(format!("{}/v1/admin/health", srv.base_url))
        .bearer_auth("key-admin")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["latest_global_seq"], 3);
    assert_eq!(body["dlq_depth"], 0);
    assert!(body["watermarks"].is_array());
}

#[tokio::test]
async fn admin_rebuild_replays_the_log_through_the_lens() {
    let srv = TestServer::spawn_default().await;
    let client = reqwest::Client::new();

    for i in 0..5 {
        client
            .post(format!("{}/v1/events", srv.base_url))
            .bearer_auth("key-write")
            .json(&note_envelope(&format!("n{i}")))
            .send()
            .await
            .unwrap();
    }

    let res = client
        .post(format!(
            "{}/v1/admin/projectors/relational/rebuild",
            srv.base_url
        ))
        .bearer_auth("key-admin")
        .json(&json!({"world_id": WORLD, "branch": "main"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["events_replayed"], 5);
    let first_hash = report["determinism_hash"].as_str().unwrap().to_string();

    // Rebuilding again over the same prefix reproduces the hash.
    let res = client
        .post(format!(
            "{}/v1/admin/projectors/relational/rebuild",
            srv.base_url
        ))
        .bearer_auth("key-admin")
        .json(&json!({"world_id": WORLD, "branch": "main"}))
        .send()
        .await
        .unwrap();
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["determinism_hash"].as_str().unwrap(), first_hash);

    // Snapshot reflects the rebuilt watermark.
    let res = client
        .post(format!(
            "{}/v1/admin/projectors/relational/snapshot",
            srv.base_url
        ))
        .bearer_auth("key-admin")
        .json(&json!({"world_id": WORLD, "branch": "main"}))
        .send()
        .await
        .unwrap();
    let snapshot: serde_json::Value = res.json().await.unwrap();
    assert_eq!(snapshot["last_processed_seq"], 5);

    // Unknown lens 404s.
    let res = client
        .post(format!("{}/v1/admin/projectors/ghost/rebuild", srv.base_url))
        .bearer_auth("key-admin")
        .json(&json!({"world_id": WORLD, "branch": "main"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let _ = &srv.services;
}
