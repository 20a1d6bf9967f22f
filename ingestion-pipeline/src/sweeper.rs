use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        kv::{EphemeralStore, KeyTtl},
        queue::TaskQueue,
    },
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::ProgressStore;

/// Delete keys under `prefix` that either never expire or outlive `max_age`.
///
/// Returns how many keys were removed.
pub async fn sweep_stale(
    kv: &dyn EphemeralStore,
    prefix: &str,
    max_age: Duration,
) -> Result<usize, AppError> {
    let keys = kv.scan_prefix(prefix).await?;
    if keys.is_empty() {
        return Ok(0);
    }

    let mut stale = Vec::new();
    for key in keys {
        match kv.ttl(&key).await? {
            KeyTtl::Persistent => stale.push(key),
            KeyTtl::Expires(remaining) if remaining > max_age => stale.push(key),
            KeyTtl::Expires(_) | KeyTtl::Missing => {}
        }
    }

    if stale.is_empty() {
        return Ok(0);
    }

    debug!(prefix, count = stale.len(), "removing stale keys");
    kv.delete(&stale).await
}

/// Read-only snapshot of what the store holds for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInspection {
    pub task_id: String,
    pub running_task_exists: bool,
    pub running_task_id: Option<String>,
    pub running_task_ttl_secs: Option<i64>,
    pub progress_exists: bool,
    pub progress_data: Option<String>,
    pub progress_ttl_secs: Option<i64>,
}

fn ttl_secs(ttl: KeyTtl) -> Option<i64> {
    match ttl {
        KeyTtl::Missing => None,
        KeyTtl::Persistent => Some(-1),
        KeyTtl::Expires(remaining) => Some(i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX)),
    }
}

/// Report the running lock held for `target` and the progress stored for `task_id`.
pub async fn inspect_task(
    store: &ProgressStore,
    task_id: &str,
    target: &str,
) -> Result<TaskInspection, AppError> {
    let kv = store.kv();
    let running_key = store.running_key(target);
    let progress_key = store.progress_key(task_id);

    let running_task_id = kv.get(&running_key).await?;
    let running_ttl = kv.ttl(&running_key).await?;
    let progress_data = kv.get(&progress_key).await?;
    let progress_ttl = kv.ttl(&progress_key).await?;

    Ok(TaskInspection {
        task_id: task_id.to_string(),
        running_task_exists: running_task_id.is_some(),
        running_task_id,
        running_task_ttl_secs: ttl_secs(running_ttl),
        progress_exists: progress_data.is_some(),
        progress_data,
        progress_ttl_secs: ttl_secs(progress_ttl),
    })
}

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    pub interval: Duration,
    pub max_age: Duration,
    /// How long a claimed envelope may go unacknowledged.
    pub lease: Duration,
}

/// Periodically sweep the running-lock and progress prefixes and hand
/// abandoned queue claims out again, until cancelled.
pub async fn run_sweeper(
    store: ProgressStore,
    queue: Arc<dyn TaskQueue>,
    settings: SweeperSettings,
    shutdown: CancellationToken,
) {
    let kv: Arc<dyn EphemeralStore> = Arc::clone(store.kv());
    let prefixes = [store.running_prefix(), store.progress_prefix()];
    // Progress records legitimately live longer than a lock.
    let progress_max_age = settings.max_age.max(store.default_ttl());

    info!(
        interval_secs = settings.interval.as_secs(),
        max_age_secs = settings.max_age.as_secs(),
        "staleness sweeper started"
    );

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("staleness sweeper stopped");
                return;
            }
            () = tokio::time::sleep(settings.interval) => {}
        }

        for (prefix, max_age) in prefixes
            .iter()
            .zip([settings.max_age, progress_max_age])
        {
            match sweep_stale(kv.as_ref(), prefix, max_age).await {
                Ok(0) => {}
                Ok(removed) => info!(%prefix, removed, "swept stale keys"),
                Err(err) => warn!(%prefix, error = %err, "stale key sweep failed"),
            }
        }

        match queue.requeue_expired(settings.lease).await {
            Ok(0) => {}
            Ok(requeued) => info!(requeued, "requeued envelopes with expired leases"),
            Err(err) => warn!(error = %err, "lease sweep failed"),
        }
    }
}
