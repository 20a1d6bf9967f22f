#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod cancellation;
pub mod catalog;
pub mod chunking;
pub mod engines;
pub mod faq;
pub mod graph;
pub mod handlers;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod services;
pub mod sweeper;
pub mod utils;

#[cfg(test)]
mod test_support;

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        queue::TaskQueue,
        types::task::{TaskEnvelope, TaskErrorInfo},
    },
};
pub use catalog::{TaskCatalog, TaskHandler, TaskRun};
pub use pipeline::{IngestionConfig, IngestionPipeline, IngestionTuning};
pub use services::{IngestionServices, ServiceBackends};
use std::sync::Arc;
use tokio::{
    task::JoinSet,
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What became of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retried { delay: Duration },
    DeadLettered,
}

/// Pulls envelopes off the queue and routes them through the catalog.
#[derive(Clone)]
pub struct TaskWorker {
    catalog: Arc<TaskCatalog>,
    queue: Arc<dyn TaskQueue>,
    tuning: IngestionTuning,
}

impl TaskWorker {
    pub fn new(catalog: Arc<TaskCatalog>, tuning: IngestionTuning) -> Self {
        let queue = Arc::clone(&catalog.services().queue);
        Self {
            catalog,
            queue,
            tuning,
        }
    }

    pub fn catalog(&self) -> &Arc<TaskCatalog> {
        &self.catalog
    }

    /// Run one delivery and release its lease. Retryable failures go back on
    /// the queue with a backoff; everything else ends in the dead-letter list.
    /// When settling fails the lease is kept, so the envelope is redelivered
    /// once it expires.
    pub async fn process_envelope(&self, envelope: TaskEnvelope) -> Result<TaskOutcome, AppError> {
        let lease_id = envelope.lease_id();
        let outcome = self.settle_delivery(envelope).await?;
        self.queue.ack(&lease_id).await?;
        Ok(outcome)
    }

    async fn settle_delivery(&self, mut envelope: TaskEnvelope) -> Result<TaskOutcome, AppError> {
        envelope.attempts += 1;
        let task_id = envelope.id.clone();

        let err = match self.catalog.dispatch(&envelope).await {
            Ok(()) => {
                info!(%task_id, task_type = %envelope.task_type, attempt = envelope.attempts, "task succeeded");
                return Ok(TaskOutcome::Succeeded);
            }
            Err(err) => err,
        };

        envelope.last_error = Some(TaskErrorInfo {
            code: Some(err.code().to_string()),
            message: err.to_string(),
        });

        if err.is_retryable() && envelope.can_retry() {
            if let AppError::PartialEngineFailure(report) = &err {
                // Only the engines that failed need another pass.
                let narrowed = envelope.decode()?.retry_scope(report);
                envelope.payload = narrowed.to_value()?;
            }
            let delay = pipeline::retry_delay(&self.tuning, envelope.attempts);
            let not_before = chrono::Duration::from_std(delay)
                .map(|offset| Utc::now() + offset)
                .unwrap_or_else(|_| Utc::now());
            envelope.not_before = Some(not_before);
            warn!(
                %task_id,
                attempt = envelope.attempts,
                max_attempts = envelope.max_attempts,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "task failed, scheduling retry"
            );
            self.queue.push(envelope).await?;
            Ok(TaskOutcome::Retried { delay })
        } else {
            error!(
                %task_id,
                attempt = envelope.attempts,
                retryable = err.is_retryable(),
                error = %err,
                "task failed permanently"
            );
            self.queue.dead_letter(envelope).await?;
            Ok(TaskOutcome::DeadLettered)
        }
    }

    /// Claim and process envelopes until `shutdown` fires.
    pub async fn run_worker_loop(&self, shutdown: CancellationToken) {
        let worker_id = format!("ingestion-worker-{}", Uuid::new_v4());
        let idle_backoff = Duration::from_millis(self.tuning.idle_backoff_ms);
        let error_backoff = Duration::from_millis(self.tuning.error_backoff_ms);
        info!(%worker_id, "ingestion worker started");

        loop {
            if shutdown.is_cancelled() {
                info!(%worker_id, "ingestion worker stopped");
                return;
            }

            let backoff = match self.queue.pop().await {
                Ok(Some(envelope)) => {
                    let task_id = envelope.id.clone();
                    info!(
                        %worker_id,
                        %task_id,
                        attempt = envelope.attempts + 1,
                        "claimed ingestion task"
                    );
                    match self.process_envelope(envelope).await {
                        Ok(_) => None,
                        Err(err) => {
                            error!(%worker_id, %task_id, error = %err, "failed to settle task");
                            Some(error_backoff)
                        }
                    }
                }
                Ok(None) => Some(idle_backoff),
                Err(err) => {
                    error!(%worker_id, error = %err, "failed to claim ingestion task");
                    warn!("Backing off for {}ms after claim error", error_backoff.as_millis());
                    Some(error_backoff)
                }
            };

            if let Some(backoff) = backoff {
                tokio::select! {
                    () = shutdown.cancelled() => {}
                    () = sleep(backoff) => {}
                }
            }
        }
    }
}

/// Run `concurrency` worker loops sharing one catalog until `shutdown` fires.
pub async fn run_worker_pool(
    worker: TaskWorker,
    concurrency: usize,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let mut workers = JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        workers.spawn(async move { worker.run_worker_loop(shutdown).await });
    }

    while let Some(joined) = workers.join_next().await {
        joined?;
    }
    Ok(())
}
