use std::sync::Arc;

use tokio::sync::watch;

use mnx_observability::MetricsRegistry;
use mnx_publisher::{Publisher, PublisherConfig};
use mnx_store::event_store::{self, PostgresEventStore};

#[tokio::main]
async fn main() {
    mnx_observability::init();

    let config = PublisherConfig::from_env().unwrap_or_else(|e| {
        tracing::error!("invalid publisher configuration: {e:#}");
        std::process::exit(1);
    });
    let policy = PublisherConfig::retry_policy_from_env().unwrap_or_else(|e| {
        tracing::error!("invalid retry configuration: {e:#}");
        std::process::exit(1);
    });

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        tracing::error!("DATABASE_URL must be set");
        std::process::exit(1);
    });
    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .expect("failed to connect to Postgres");
    event_store::run_migrations(&pool)
        .await
        .expect("schema migration failed");

    let store = Arc::new(PostgresEventStore::new(pool, policy));
    let metrics = Arc::new(MetricsRegistry::new());
    let publisher = Publisher::new(store, config, metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        }
    });

    publisher.run(shutdown_rx).await;
}
