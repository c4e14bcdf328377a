use std::sync::Arc;

use mnx_observability::MetricsRegistry;
use mnx_projector::config::{LensKind, ProjectorConfig};
use mnx_projector::embedding::HashEmbedder;
use mnx_projector::lenses::{GraphLens, RelationalLens, SemanticLens};
use mnx_projector::receiver::{ProjectorRuntime, router};
use mnx_projector::sdk::{Lens, ProjectorCore};
use mnx_projector::translator::{HttpEmoSink, TranslatorLens};
use mnx_store::{
    InMemoryWatermarkStore, PostgresWatermarkStore, WatermarkStore,
    event_store::{self, PostgresEventStore},
    RetryPolicy,
};

#[tokio::main]
async fn main() {
    mnx_observability::init();

    let config = ProjectorConfig::from_env().unwrap_or_else(|e| {
        tracing::error!("invalid projector configuration: {e:#}");
        std::process::exit(1);
    });

    let mut runtime_source = None;
    let watermarks: Arc<dyn WatermarkStore> = match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .expect("failed to connect to Postgres");
            event_store::run_migrations(&pool)
                .await
                .expect("schema migration failed");
            runtime_source = Some(Arc::new(PostgresEventStore::new(
                pool.clone(),
                RetryPolicy::default(),
            )) as Arc<dyn mnx_store::EventStore>);
            Arc::new(PostgresWatermarkStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory watermarks (dev mode)");
            Arc::new(InMemoryWatermarkStore::new())
        }
    };

    let lens: Arc<dyn Lens> = match config.lens {
        LensKind::Relational => Arc::new(RelationalLens::new()),
        LensKind::Semantic => {
            let embedder = Arc::new(HashEmbedder::with_identity(
                config.embedding.model_id.clone(),
                config.embedding.model_version.clone(),
                config.embedding.vector_dim,
            ));
            Arc::new(SemanticLens::with_template(
                embedder,
                config.embedding.template_id.clone(),
            ))
        }
        LensKind::Graph => Arc::new(GraphLens::new()),
        LensKind::Translator => {
            let sink = Arc::new(HttpEmoSink::new(
                config.gateway_url.clone().expect("checked in config"),
                config.gateway_api_key.clone().unwrap_or_default(),
            ));
            Arc::new(TranslatorLens::new(sink))
        }
    };

    let core = Arc::new(ProjectorCore::new(lens.name(), lens, watermarks));
    let metrics = Arc::new(MetricsRegistry::new());

    // Periodic watermark gauge refresh.
    {
        let core = core.clone();
        let metrics = metrics.clone();
        let interval = std::time::Duration::from_secs(config.metrics_interval_s.max(1));
        tokio::spawn(async move {
            loop {
                if let Ok(count) = core.watermarks().count(core.name()).await {
                    metrics.gauge("projector_watermarks").set(count as f64);
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    // Periodic health line + per-scope state hash audit.
    {
        let core = core.clone();
        let health_interval = std::time::Duration::from_secs(config.health_interval_s.max(1));
        let hash_every = (config.state_hash_interval_s / config.health_interval_s.max(1)).max(1);
        tokio::spawn(async move {
            let mut ticks = 0u64;
            loop {
                tokio::time::sleep(health_interval).await;
                ticks += 1;
                let watermarks = match core.watermarks().list().await {
                    Ok(list) => list,
                    Err(e) => {
                        tracing::warn!(error = %e, "watermark listing failed");
                        continue;
                    }
                };
                let own: Vec<_> = watermarks
                    .into_iter()
                    .filter(|wm| wm.projector == core.name())
                    .collect();
                tracing::info!(projector = core.name(), scopes = own.len(), "projector healthy");

                if ticks % hash_every == 0 {
                    for wm in &own {
                        match core.state_hash(&wm.scope).await {
                            Ok(hash) => tracing::debug!(
                                scope = %wm.scope,
                                state_hash = %hash,
                                "state hash audit"
                            ),
                            Err(e) => tracing::warn!(scope = %wm.scope, error = %e, "state hash failed"),
                        }
                    }
                }
            }
        });
    }

    let mut runtime = ProjectorRuntime::new(core, metrics);
    if let Some(source) = runtime_source {
        runtime = runtime.with_replay_source(source);
    }
    let app = router(Arc::new(runtime));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        });

    tracing::info!("projector listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}
