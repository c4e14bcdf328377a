//! Infrastructure wiring for the gateway process.
//!
//! Dev/test mode wires everything in-memory, including colocated projector
//! cores so the admin surface (snapshot/restore/rebuild) works end to end in
//! one process. Persistent mode backs the spine with Postgres; projectors
//! then run as their own `mnx-projector` processes and the publisher fans
//! out to them, so the colocated registry stays empty and admin operations
//! are issued against the projectors' own `/admin` routes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;

use mnx_events::ValidationLimits;
use mnx_projector::embedding::HashEmbedder;
use mnx_projector::lenses::{GraphLens, RelationalLens, SemanticLens};
use mnx_projector::sdk::{Lens, ProjectorCore};
use mnx_projector::translator::{StoreEmoSink, TranslatorLens};
use mnx_store::{
    BranchStore, EventStore, InMemoryBranchStore, InMemoryEventStore, InMemoryWatermarkStore,
    PostgresBranchStore, PostgresEventStore, PostgresWatermarkStore, RetryPolicy, WatermarkStore,
    event_store,
};

use crate::config::GatewayConfig;

pub struct AppServices {
    pub store: Arc<dyn EventStore>,
    pub branches: Arc<dyn BranchStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    /// Colocated projector cores by lens name (dev/test wiring).
    pub projectors: HashMap<String, Arc<ProjectorCore>>,
    pub limits: ValidationLimits,
    pub idempotency_required: HashSet<String>,
}

impl AppServices {
    pub fn projector(&self, lens: &str) -> Option<&Arc<ProjectorCore>> {
        self.projectors.get(lens)
    }
}

pub async fn build_services(config: &GatewayConfig) -> AppServices {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        build_persistent_services(config).await
    } else {
        build_in_memory_services(config)
    }
}

fn limits(config: &GatewayConfig) -> ValidationLimits {
    ValidationLimits {
        max_future_skew: Duration::minutes(config.max_future_skew_minutes),
    }
}

fn build_in_memory_services(config: &GatewayConfig) -> AppServices {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(RetryPolicy::default()));
    let branches: Arc<dyn BranchStore> = Arc::new(InMemoryBranchStore::new());
    let watermarks: Arc<dyn WatermarkStore> = Arc::new(InMemoryWatermarkStore::new());

    let mut projectors = HashMap::new();
    let lenses: Vec<Arc<dyn Lens>> = vec![
        Arc::new(RelationalLens::new()),
        Arc::new(SemanticLens::new(Arc::new(HashEmbedder::new(384)))),
        Arc::new(GraphLens::new()),
        Arc::new(TranslatorLens::new(Arc::new(StoreEmoSink::new(
            store.clone(),
        )))),
    ];
    for lens in lenses {
        let core = Arc::new(ProjectorCore::new(lens.name(), lens, watermarks.clone()));
        projectors.insert(core.name().to_string(), core);
    }

    AppServices {
        store,
        branches,
        watermarks,
        projectors,
        limits: limits(config),
        idempotency_required: config
            .idempotency_required_for_kinds
            .iter()
            .cloned()
            .collect(),
    }
}

async fn build_persistent_services(config: &GatewayConfig) -> AppServices {
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");

    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .expect("failed to connect to Postgres");
    event_store::run_migrations(&pool)
        .await
        .expect("schema migration failed");

    AppServices {
        store: Arc::new(PostgresEventStore::new(pool.clone(), RetryPolicy::default())),
        branches: Arc::new(PostgresBranchStore::new(pool.clone())),
        watermarks: Arc::new(PostgresWatermarkStore::new(pool)),
        projectors: HashMap::new(),
        limits: limits(config),
        idempotency_required: config
            .idempotency_required_for_kinds
            .iter()
            .cloned()
            .collect(),
    }
}
