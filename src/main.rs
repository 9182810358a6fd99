use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ingest_core::config::IngestConfig;
use ingest_core::listener;
use ingest_core::metrics::Metrics;
use ingest_core::store::postgres::PgStore;
use ingest_core::store::StoreGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config_path = std::env::var("INGEST_CONFIG").unwrap_or_else(|_| "./ingest.toml".to_string());
    let config = IngestConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone())),
        )
        .init();

    tracing::info!("starting telemetry ingestion core");

    let store: Arc<dyn StoreGateway> =
        Arc::new(PgStore::connect(&config.store.database_url, config.store.max_connections).await?);

    let metrics = Arc::new(Metrics::new());
    metrics.clone().spawn_reporter();

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_cancel.cancel();
        }
    });

    listener::run(Arc::new(config), store, metrics, cancel).await?;

    tracing::info!("telemetry ingestion core stopped");
    Ok(())
}
