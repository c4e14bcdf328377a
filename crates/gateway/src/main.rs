use std::sync::Arc;

use mnx_gateway::app::{build_app, services};
use mnx_gateway::config::GatewayConfig;

#[tokio::main]
async fn main() {
    mnx_observability::init();

    let config = GatewayConfig::from_env().unwrap_or_else(|e| {
        tracing::error!("invalid gateway configuration: {e:#}");
        std::process::exit(1);
    });

    let services = Arc::new(services::build_services(&config).await);
    let app = build_app(services, &config);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        });

    tracing::info!("gateway listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}
