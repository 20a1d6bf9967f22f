use std::collections::HashMap;

use common::error::AppError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Entry {
    task_id: String,
    token: CancellationToken,
}

/// One live cancellation token per target. Registering a new task for a
/// target cancels whatever was running for it before.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, target: &str, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.entries.lock().await.insert(
            target.to_string(),
            Entry {
                task_id: task_id.to_string(),
                token: token.clone(),
            },
        );

        if let Some(previous) = previous {
            if previous.task_id != task_id {
                info!(
                    %target,
                    superseded = %previous.task_id,
                    by = %task_id,
                    "cancelling superseded task"
                );
                previous.token.cancel();
            }
        }
        token
    }

    /// Drop the registration if `task_id` still owns it.
    pub async fn finish(&self, target: &str, task_id: &str) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(target)
            .is_some_and(|entry| entry.task_id == task_id)
        {
            entries.remove(target);
        }
    }

    pub async fn cancel(&self, target: &str) -> bool {
        match self.entries.lock().await.remove(target) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }
}

/// `Cancelled` once the token has fired.
pub fn ensure_active(token: &CancellationToken, task_id: &str) -> Result<(), AppError> {
    if token.is_cancelled() {
        return Err(AppError::Cancelled(format!(
            "task {task_id} was superseded or cancelled"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newer_task_cancels_previous() {
        let registry = CancellationRegistry::new();
        let first = registry.register("k-1", "t1").await;
        let second = registry.register("k-1", "t2").await;

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(ensure_active(&first, "t1").is_err());
        assert!(ensure_active(&second, "t2").is_ok());
    }

    #[tokio::test]
    async fn finish_only_clears_own_registration() {
        let registry = CancellationRegistry::new();
        let _first = registry.register("k-1", "t1").await;
        let second = registry.register("k-1", "t2").await;

        registry.finish("k-1", "t1").await;
        assert!(registry.cancel("k-1").await);
        assert!(second.is_cancelled());
        assert!(!registry.cancel("k-1").await);
    }
}
