pub mod clone;
pub mod deletion;
pub mod document;
pub mod extract;
pub mod faq_import;
pub mod questions;
pub mod summary;
pub mod table;

use common::{
    error::AppError,
    storage::types::{
        progress::{ProgressRecord, ProgressStatus},
        task::{TaskPayload, TaskType},
    },
};
use tracing::{debug, warn};

use crate::{
    catalog::TaskRun,
    progress::{ProgressTracker, RunningLock},
    services::IngestionServices,
};

/// Claim the running lock for `progress_id` and start (or resume) its progress.
///
/// An unfinished record is reused when `resumable` accepts it; otherwise the
/// run starts from a fresh record.
pub(crate) async fn begin(
    services: &IngestionServices,
    run: &TaskRun,
    task_type: TaskType,
    progress_id: &str,
    resumable: impl FnOnce(&ProgressRecord) -> bool,
) -> Result<ProgressTracker, AppError> {
    let lock = RunningLock::acquire(&services.progress, progress_id, &run.id, services.lock_ttl())
        .await?;

    let existing = match services.progress.find_progress(progress_id).await {
        Ok(existing) => existing,
        Err(err) => {
            release_quietly(lock).await;
            return Err(err);
        }
    };
    let record = match existing {
        Some(record) if record.status != ProgressStatus::Completed && resumable(&record) => {
            debug!(task_id = %progress_id, status = record.status.as_str(), "resuming progress");
            record
        }
        _ => ProgressRecord::new(progress_id, task_type.as_str()),
    };

    let mut tracker = ProgressTracker::new(services.progress.clone(), record).with_lock(lock);
    let started = if tracker.status() == ProgressStatus::Processing {
        tracker.save().await
    } else {
        tracker.start(format!("{task_type} started")).await
    };
    match started {
        Ok(()) => Ok(tracker),
        Err(err) => {
            settle_failed(tracker, &err).await;
            Err(err)
        }
    }
}

/// Finalize progress from the handler's outcome and release the lock.
pub(crate) async fn settle(
    tracker: ProgressTracker,
    outcome: Result<String, AppError>,
) -> Result<(), AppError> {
    match outcome {
        Ok(message) => {
            tracker.complete(message).await?;
            Ok(())
        }
        Err(err) => {
            settle_failed(tracker, &err).await;
            Err(err)
        }
    }
}

async fn settle_failed(tracker: ProgressTracker, err: &AppError) {
    let task_id = tracker.task_id().to_string();
    if let Err(progress_err) = tracker.fail(err).await {
        warn!(%task_id, error = %progress_err, "could not record task failure");
    }
}

async fn release_quietly(lock: RunningLock) {
    let key = lock.key().to_string();
    if let Err(err) = lock.release().await {
        warn!(%key, error = %err, "could not release running lock");
    }
}

/// Internal error for a payload routed to the wrong handler.
pub(crate) fn misrouted(expected: TaskType, payload: &TaskPayload) -> AppError {
    AppError::InternalError(format!(
        "{expected} handler received a {} payload",
        payload.task_type()
    ))
}
