use chrono::Utc;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;

use crate::error::AppError;

use super::engine::EngineReport;
use super::faq::{FaqFailedEntry, FaqSuccessEntry, ImportMode};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Processing => "processing",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressTransition {
    Start,
    Complete,
    Fail,
}

impl ProgressTransition {
    fn as_str(self) -> &'static str {
        match self {
            ProgressTransition::Start => "start",
            ProgressTransition::Complete => "complete",
            ProgressTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: ProgressMachine,
        initial: Pending,
        states: [Pending, Processing, Completed, Failed],
        events {
            start {
                transition: { from: Pending, to: Processing }
                transition: { from: Failed, to: Processing }
            }
            complete {
                transition: { from: Processing, to: Completed }
            }
            fail {
                transition: { from: Pending, to: Failed }
                transition: { from: Processing, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> ProgressMachine<(), Pending> {
        ProgressMachine::new(())
    }
}

fn invalid_transition(state: ProgressStatus, event: ProgressTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid progress transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn rejected<E>(state: ProgressStatus, event: ProgressTransition) -> impl FnOnce(E) -> AppError {
    move |_| invalid_transition(state, event)
}

/// Resolve the status reached by `event`, rejecting transitions the lifecycle forbids.
pub fn next_status(
    state: ProgressStatus,
    event: ProgressTransition,
) -> Result<ProgressStatus, AppError> {
    use lifecycle::pending;

    match (state, event) {
        (ProgressStatus::Pending, ProgressTransition::Start) => pending()
            .start()
            .map(|_| ProgressStatus::Processing)
            .map_err(rejected(state, event)),
        (ProgressStatus::Pending, ProgressTransition::Fail) => pending()
            .fail()
            .map(|_| ProgressStatus::Failed)
            .map_err(rejected(state, event)),
        (ProgressStatus::Processing, ProgressTransition::Complete) => pending()
            .start()
            .map_err(rejected(state, event))?
            .complete()
            .map(|_| ProgressStatus::Completed)
            .map_err(rejected(state, event)),
        (ProgressStatus::Processing, ProgressTransition::Fail) => pending()
            .start()
            .map_err(rejected(state, event))?
            .fail()
            .map(|_| ProgressStatus::Failed)
            .map_err(rejected(state, event)),
        (ProgressStatus::Failed, ProgressTransition::Start) => pending()
            .fail()
            .map_err(rejected(state, event))?
            .start()
            .map(|_| ProgressStatus::Processing)
            .map_err(rejected(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

/// Polling view of a running task, stored in the ephemeral store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,
    #[serde(default)]
    pub task_type: String,
    pub status: ProgressStatus,
    /// Percentage, 0 to 100.
    pub progress: u8,
    pub total: usize,
    pub processed: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub skipped_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_entries: Vec<FaqFailedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_entries_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_entries: Vec<FaqSuccessEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_entries_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_entry_indices: Vec<usize>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_mode: Option<ImportMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_report: Option<EngineReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProgressRecord {
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// Percentage derived from `processed / total`, clamped to 100.
    pub fn percent(processed: usize, total: usize) -> u8 {
        if total == 0 {
            return 0;
        }
        let pct = processed.saturating_mul(100) / total;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_allows_expected_transitions() {
        assert_eq!(
            next_status(ProgressStatus::Pending, ProgressTransition::Start).expect("start"),
            ProgressStatus::Processing
        );
        assert_eq!(
            next_status(ProgressStatus::Processing, ProgressTransition::Complete)
                .expect("complete"),
            ProgressStatus::Completed
        );
        assert_eq!(
            next_status(ProgressStatus::Pending, ProgressTransition::Fail).expect("fail"),
            ProgressStatus::Failed
        );
        assert_eq!(
            next_status(ProgressStatus::Failed, ProgressTransition::Start).expect("resume"),
            ProgressStatus::Processing
        );
    }

    #[test]
    fn lifecycle_rejects_invalid_transitions() {
        assert!(next_status(ProgressStatus::Completed, ProgressTransition::Start).is_err());
        assert!(next_status(ProgressStatus::Pending, ProgressTransition::Complete).is_err());
        assert!(next_status(ProgressStatus::Completed, ProgressTransition::Fail).is_err());
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(ProgressRecord::percent(0, 0), 0);
        assert_eq!(ProgressRecord::percent(1, 3), 33);
        assert_eq!(ProgressRecord::percent(5, 3), 100);
    }

    #[test]
    fn record_serializes_status_lowercase() {
        let record = ProgressRecord::new("t1", "faq:import");
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["task_type"], "faq:import");
    }
}
