//! Operator view of the task store: running locks, progress records and the queue.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::utils::config::get_config;
use ingestion_pipeline::{
    sweeper::{inspect_task, sweep_stale},
    IngestionServices,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the running lock and progress keys held for a task
    Status {
        task_id: String,
        /// Lock target, when it differs from the task id
        #[arg(long)]
        target: Option<String>,
    },
    /// Print the stored progress record for a task
    Progress { task_id: String },
    /// Remove lock and progress keys that never expire or outlive their bound,
    /// and requeue claims whose lease expired
    Sweep {
        /// Override the configured maximum remaining lifetime, in seconds
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Number of envelopes waiting in the queue and currently claimed
    Queue,
    /// Dump dead-lettered envelopes as JSON
    DeadLetters,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;
    if config.redis_url.is_none() {
        bail!("redis_url must be configured to inspect a running worker");
    }
    let sweep_max_age = config.sweep_max_age_secs;
    let lease = Duration::from_secs(config.task_lease_secs);
    let services = IngestionServices::connect(config).await?;
    let progress = &services.progress;

    match cli.command {
        Command::Status { task_id, target } => {
            let target = target.unwrap_or_else(|| task_id.clone());
            let inspection = inspect_task(progress, &task_id, &target).await?;
            println!("{}", serde_json::to_string_pretty(&inspection)?);
        }
        Command::Progress { task_id } => match progress.find_progress(&task_id).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => bail!("no progress stored for {task_id}"),
        },
        Command::Sweep { max_age_secs } => {
            let max_age = Duration::from_secs(max_age_secs.unwrap_or(sweep_max_age));
            let kv = progress.kv();
            let locks = sweep_stale(kv.as_ref(), &progress.running_prefix(), max_age).await?;
            let records = sweep_stale(
                kv.as_ref(),
                &progress.progress_prefix(),
                max_age.max(progress.default_ttl()),
            )
            .await?;
            let requeued = services.queue.requeue_expired(lease).await?;
            println!(
                "removed {locks} running locks and {records} progress records, requeued {requeued} expired claims"
            );
        }
        Command::Queue => println!(
            "ready: {}, in flight: {}",
            services.queue.len().await?,
            services.queue.in_flight().await?
        ),
        Command::DeadLetters => {
            let dead = services.queue.dead_letters().await?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
        }
    }
    Ok(())
}
