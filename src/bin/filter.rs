// Filter service - consumes collection updates and provides filtered views.

use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshkv::{
    api::create_filter_router,
    config::FilterConfig,
    infrastructure::bus::{KafkaBus, MessageBus},
    services::FilterService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = FilterConfig::from_env()?;
    let bus: Arc<dyn MessageBus> = Arc::new(KafkaBus::connect(&config.kafka_broker_url)?);
    let service = Arc::new(FilterService::new(bus));

    service.start().await?;

    let app = create_filter_router(service.clone()).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let addr = config.server_address();
    info!("🚀 Filter service starting on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.stop().await;
    info!("Filter service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}
