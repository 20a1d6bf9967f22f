use std::{sync::Arc, time::Duration};

use common::utils::config::get_config;
use ingestion_pipeline::{
    run_worker_pool,
    sweeper::{run_sweeper, SweeperSettings},
    IngestionConfig, IngestionServices, TaskCatalog, TaskWorker,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let concurrency = config.worker_concurrency;
    let sweeper_settings = SweeperSettings {
        interval: Duration::from_secs(config.sweep_interval_secs),
        max_age: Duration::from_secs(config.sweep_max_age_secs),
        lease: Duration::from_secs(config.task_lease_secs),
    };

    let services = Arc::new(IngestionServices::connect(config).await?);
    let pipeline_config = IngestionConfig::default();
    let tuning = pipeline_config.tuning.clone();
    let catalog = Arc::new(TaskCatalog::with_default_handlers(
        Arc::clone(&services),
        pipeline_config,
    ));
    let worker = TaskWorker::new(catalog, tuning);

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(
        services.progress.clone(),
        Arc::clone(&services.queue),
        sweeper_settings,
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested, draining workers");
        signal_token.cancel();
    });

    info!(concurrency, "starting ingestion workers");
    run_worker_pool(worker, concurrency, shutdown).await?;
    sweeper.await?;
    Ok(())
}
