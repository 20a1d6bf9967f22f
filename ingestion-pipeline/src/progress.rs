use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        kv::EphemeralStore,
        types::progress::{next_status, ProgressRecord, ProgressStatus, ProgressTransition},
    },
};
use tracing::{debug, warn};

const PROGRESS_SEGMENT: &str = "progress";
const RUNNING_SEGMENT: &str = "running";

/// Progress records and running locks in the ephemeral store.
#[derive(Clone)]
pub struct ProgressStore {
    kv: Arc<dyn EphemeralStore>,
    prefix: String,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(kv: Arc<dyn EphemeralStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn kv(&self) -> &Arc<dyn EphemeralStore> {
        &self.kv
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    pub fn progress_prefix(&self) -> String {
        format!("{}:{PROGRESS_SEGMENT}:", self.prefix)
    }

    pub fn running_prefix(&self) -> String {
        format!("{}:{RUNNING_SEGMENT}:", self.prefix)
    }

    pub fn progress_key(&self, task_id: &str) -> String {
        format!("{}{task_id}", self.progress_prefix())
    }

    pub fn running_key(&self, target: &str) -> String {
        format!("{}{target}", self.running_prefix())
    }

    pub async fn set_progress(
        &self,
        task_id: &str,
        record: &ProgressRecord,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let raw = serde_json::to_string(record)?;
        self.kv
            .set(&self.progress_key(task_id), &raw, Some(ttl))
            .await
    }

    /// Fetch a record. A missing key is `NotFound`; store failures propagate as-is.
    pub async fn get_progress(&self, task_id: &str) -> Result<ProgressRecord, AppError> {
        self.find_progress(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("progress for task {task_id}")))
    }

    pub async fn find_progress(&self, task_id: &str) -> Result<Option<ProgressRecord>, AppError> {
        let Some(raw) = self.kv.get(&self.progress_key(task_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn delete_progress(&self, task_id: &str) -> Result<bool, AppError> {
        let removed = self.kv.delete(&[self.progress_key(task_id)]).await?;
        Ok(removed > 0)
    }
}

/// Exclusive claim on a target. The value stored under the key is the owner id.
pub struct RunningLock {
    kv: Arc<dyn EphemeralStore>,
    key: String,
    owner: String,
    ttl: Duration,
}

impl RunningLock {
    /// Claim `target` for `owner`. A redelivered task that already owns the
    /// lock re-enters it; any other holder yields `StaleLock`.
    pub async fn acquire(
        store: &ProgressStore,
        target: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Self, AppError> {
        let kv = Arc::clone(store.kv());
        let key = store.running_key(target);

        if !kv.set_if_absent(&key, owner, ttl).await? {
            match kv.get(&key).await? {
                Some(holder) if holder == owner => {
                    kv.expire(&key, ttl).await?;
                    debug!(%key, %owner, "re-entered running lock");
                }
                Some(holder) => {
                    return Err(AppError::StaleLock(format!("{target} is held by {holder}")));
                }
                None => {
                    // Expired between the two calls.
                    if !kv.set_if_absent(&key, owner, ttl).await? {
                        return Err(AppError::StaleLock(format!(
                            "{target} was claimed concurrently"
                        )));
                    }
                }
            }
        }

        Ok(Self {
            kv,
            key,
            owner: owner.to_string(),
            ttl,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lock. Fails with `StaleLock` once ownership has been lost.
    pub async fn refresh(&self) -> Result<(), AppError> {
        match self.kv.get(&self.key).await? {
            Some(holder) if holder == self.owner => {
                self.kv.expire(&self.key, self.ttl).await?;
                Ok(())
            }
            _ => Err(AppError::StaleLock(format!(
                "lock {} no longer owned by {}",
                self.key, self.owner
            ))),
        }
    }

    /// Release the lock if this owner still holds it.
    pub async fn release(self) -> Result<bool, AppError> {
        let released = self.kv.compare_and_delete(&self.key, &self.owner).await?;
        if !released {
            warn!(key = %self.key, owner = %self.owner, "running lock was not held at release");
        }
        Ok(released)
    }
}

/// Writer-side view of one task's progress.
///
/// Status changes go through the progress lifecycle, `processed` and
/// `progress` never move backwards while the task is live, and a failed
/// record always carries an error. Finishing the task releases the lock.
pub struct ProgressTracker {
    store: ProgressStore,
    record: ProgressRecord,
    lock: Option<RunningLock>,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(store: ProgressStore, record: ProgressRecord) -> Self {
        Self {
            store,
            record,
            lock: None,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_lock(mut self, lock: RunningLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn task_id(&self) -> &str {
        &self.record.task_id
    }

    pub fn status(&self) -> ProgressStatus {
        self.record.status
    }

    /// Edit descriptive fields. Status and error are restored afterwards and
    /// counters may only grow.
    pub fn annotate(&mut self, edit: impl FnOnce(&mut ProgressRecord)) {
        let status = self.record.status;
        let error = self.record.error.clone();
        let processed = self.record.processed;
        let progress = self.record.progress;

        edit(&mut self.record);

        self.record.status = status;
        self.record.error = error;
        self.record.processed = self.record.processed.max(processed);
        self.record.progress = self.record.progress.max(progress).min(100);
    }

    pub fn set_total(&mut self, total: usize) {
        self.record.total = total;
    }

    pub async fn save(&mut self) -> Result<(), AppError> {
        self.record.updated_at = Utc::now().timestamp();
        let ttl = self.store.default_ttl();
        self.store
            .set_progress(&self.record.task_id, &self.record, ttl)
            .await?;
        if let Some(lock) = &self.lock {
            lock.refresh().await?;
        }
        Ok(())
    }

    fn transition(&mut self, event: ProgressTransition) -> Result<(), AppError> {
        self.record.status = next_status(self.record.status, event)?;
        Ok(())
    }

    pub async fn start(&mut self, message: impl Into<String>) -> Result<(), AppError> {
        self.transition(ProgressTransition::Start)?;
        self.record.error.clear();
        self.record.message = message.into();
        self.started = Instant::now();
        self.save().await
    }

    /// Record forward progress. Lower values than already reported are ignored.
    pub async fn advance(
        &mut self,
        processed: usize,
        message: impl Into<String>,
    ) -> Result<(), AppError> {
        if self.record.status != ProgressStatus::Processing {
            return Err(AppError::Validation(format!(
                "cannot advance task {} in status {}",
                self.record.task_id,
                self.record.status.as_str()
            )));
        }
        let processed = processed.max(self.record.processed);
        let percent = ProgressRecord::percent(processed, self.record.total).min(99);
        self.record.processed = processed;
        self.record.progress = self.record.progress.max(percent);
        self.record.message = message.into();
        self.save().await
    }

    pub async fn complete(mut self, message: impl Into<String>) -> Result<ProgressRecord, AppError> {
        self.transition(ProgressTransition::Complete)?;
        self.record.progress = 100;
        self.record.processed = self.record.processed.max(self.record.total);
        self.record.message = message.into();
        self.record.processing_time_ms = Some(self.elapsed_ms());
        self.finish().await
    }

    pub async fn fail(mut self, error: &AppError) -> Result<ProgressRecord, AppError> {
        self.transition(ProgressTransition::Fail)?;
        let reason = error.to_string();
        self.record.error = if reason.trim().is_empty() {
            error.code().to_string()
        } else {
            reason
        };
        self.record.message = "task failed".into();
        self.record.processing_time_ms = Some(self.elapsed_ms());
        self.finish().await
    }

    /// Persist the final record and release the lock, even when the save fails.
    async fn finish(mut self) -> Result<ProgressRecord, AppError> {
        let saved = self.save().await;
        let released = match self.lock.take() {
            Some(lock) => lock.release().await.map(|_| ()),
            None => Ok(()),
        };
        match (saved, released) {
            (Ok(()), Ok(())) => Ok(self.record),
            (Err(err), Err(release_err)) => {
                warn!(task_id = %self.record.task_id, error = %release_err, "running lock not released");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::kv::{KeyTtl, MemoryKvStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose plain writes can be switched off.
    #[derive(Default)]
    struct BrokenWrites {
        inner: MemoryKvStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl EphemeralStore for BrokenWrites {
        async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::StoreUnavailable("write rejected".into()));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
            self.inner.expire(key, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> Result<usize, AppError> {
            self.inner.delete(keys).await
        }

        async fn ttl(&self, key: &str) -> Result<KeyTtl, AppError> {
            self.inner.ttl(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, AppError> {
            self.inner.scan_prefix(prefix).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, AppError> {
            self.inner.compare_and_delete(key, expected).await
        }
    }

    fn store() -> ProgressStore {
        ProgressStore::new(
            Arc::new(MemoryKvStore::new()),
            "test",
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn missing_progress_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_progress("nope").await,
            Err(AppError::NotFound(_))
        ));
        assert!(store.find_progress("nope").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn progress_round_trips_and_deletes() {
        let store = store();
        let record = ProgressRecord::new("t1", "kb:clone");
        store
            .set_progress("t1", &record, Duration::from_secs(5))
            .await
            .expect("set");
        assert_eq!(store.get_progress("t1").await.expect("get"), record);
        assert!(store.delete_progress("t1").await.expect("delete"));
        assert!(!store.delete_progress("t1").await.expect("delete"));
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_released_by_owner_only() {
        let store = store();
        let ttl = Duration::from_secs(30);
        let lock = RunningLock::acquire(&store, "kb-1", "task-a", ttl)
            .await
            .expect("acquire");

        let contender = RunningLock::acquire(&store, "kb-1", "task-b", ttl).await;
        assert!(matches!(contender, Err(AppError::StaleLock(_))));

        let again = RunningLock::acquire(&store, "kb-1", "task-a", ttl)
            .await
            .expect("owner re-enters");
        assert!(again.release().await.expect("release"));
        assert!(!lock.release().await.expect("second release"));

        RunningLock::acquire(&store, "kb-1", "task-b", ttl)
            .await
            .expect("free again");
    }

    #[tokio::test]
    async fn tracker_keeps_counters_monotonic() {
        let store = store();
        let mut record = ProgressRecord::new("t2", "faq:import");
        record.total = 10;
        let mut tracker = ProgressTracker::new(store.clone(), record);
        tracker.start("running").await.expect("start");

        tracker.advance(6, "batch").await.expect("advance");
        tracker.advance(3, "late batch").await.expect("advance");
        let saved = store.get_progress("t2").await.expect("get");
        assert_eq!(saved.processed, 6);
        assert_eq!(saved.progress, 60);

        tracker.annotate(|r| {
            r.processed = 1;
            r.status = ProgressStatus::Completed;
            r.success_count = 4;
        });
        assert_eq!(tracker.record().processed, 6);
        assert_eq!(tracker.status(), ProgressStatus::Processing);
        assert_eq!(tracker.record().success_count, 4);

        let done = tracker.complete("done").await.expect("complete");
        assert_eq!(done.status, ProgressStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.processing_time_ms.is_some());
    }

    #[tokio::test]
    async fn failing_records_error_and_releases_lock() {
        let store = store();
        let ttl = Duration::from_secs(30);
        let lock = RunningLock::acquire(&store, "k-9", "t3", ttl)
            .await
            .expect("acquire");
        let mut tracker =
            ProgressTracker::new(store.clone(), ProgressRecord::new("t3", "document:process"))
                .with_lock(lock);
        tracker.start("parsing").await.expect("start");

        let failed = tracker
            .fail(&AppError::Cancelled("superseded".into()))
            .await
            .expect("fail");
        assert_eq!(failed.status, ProgressStatus::Failed);
        assert!(failed.error.contains("superseded"));

        RunningLock::acquire(&store, "k-9", "t4", ttl)
            .await
            .expect("lock released");
    }

    #[tokio::test]
    async fn completing_without_start_is_rejected() {
        let tracker = ProgressTracker::new(store(), ProgressRecord::new("t5", "kb:clone"));
        assert!(matches!(
            tracker.complete("done").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn lock_is_released_when_the_final_save_fails() {
        let kv = Arc::new(BrokenWrites::default());
        let store = ProgressStore::new(
            Arc::clone(&kv) as Arc<dyn EphemeralStore>,
            "test",
            Duration::from_secs(60),
        );
        let ttl = Duration::from_secs(30);
        let lock = RunningLock::acquire(&store, "k-7", "t6", ttl)
            .await
            .expect("acquire");
        let mut tracker =
            ProgressTracker::new(store.clone(), ProgressRecord::new("t6", "faq:import"))
                .with_lock(lock);
        tracker.start("importing").await.expect("start");

        kv.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            tracker.complete("done").await,
            Err(AppError::StoreUnavailable(_))
        ));

        RunningLock::acquire(&store, "k-7", "t7", ttl)
            .await
            .expect("lock released despite failed save");
    }
}
