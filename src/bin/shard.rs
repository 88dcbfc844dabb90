// Shard service - a single node (replica) storing a subset of the data.

use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshkv::{
    api::create_shard_router,
    config::ShardConfig,
    infrastructure::bus::{KafkaBus, MessageBus},
    services::StorageService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ShardConfig::from_env()?;
    let bus: Arc<dyn MessageBus> = Arc::new(KafkaBus::connect(&config.kafka_broker_url)?);
    let service = Arc::new(StorageService::from_config(&config, bus)?);

    service.start().await?;
    service.register_self().await;

    let app = create_shard_router(service.clone()).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let addr = config.server_address();
    info!(
        "🚀 Shard node starting on http://{} (group {}, {})",
        addr,
        config.group_id,
        if config.is_leader { "Leader" } else { "Follower" }
    );

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.stop().await;
    info!("Shard node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}
