// Coordinator service - topology registry and request router.

use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshkv::{
    api::create_coordinator_router, config::CoordinatorConfig, services::CoordinatorService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoordinatorConfig::from_env()?;
    let service = Arc::new(CoordinatorService::new()?);

    let app = create_coordinator_router(service).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let addr = config.server_address();
    info!("🚀 Coordinator starting on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}
