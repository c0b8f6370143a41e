use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use classbook::config::Config;
use classbook::{BillingLedger, ReservationEngine, ScheduleCatalog, Store, observability, sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(Store::open(config.wal_path(), config.store.clone())?);
    let catalog = Arc::new(ScheduleCatalog::new(store.clone()));
    let ledger = Arc::new(BillingLedger::new(store.clone()));
    // The reservation surface is a library; this process owns the store and
    // its background tasks until asked to stop.
    let _engine = Arc::new(ReservationEngine::new(store.clone(), ledger.clone()));

    let sweeper_task = tokio::spawn(sweeper::run_overdue_sweeper(ledger.clone(), config.sweep_interval));
    let compactor_task = tokio::spawn(sweeper::run_compactor(store.clone(), config.compact_threshold));

    info!("classbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  upcoming classes: {}", catalog.upcoming_classes(classbook::validate::now_ms()).await.len());
    info!("  lock_timeout: {}ms", config.store.lock_timeout.as_millis());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    shutdown_signal().await?;
    info!("shutdown signal received");

    sweeper_task.abort();
    compactor_task.abort();
    match sweeper::compact_if_needed(&store, 1).await {
        Ok(true) => info!("final compaction done"),
        Ok(false) => {}
        Err(e) => tracing::warn!("final compaction failed: {e}"),
    }

    info!("classbook stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
