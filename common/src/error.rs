use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::storage::types::engine::EngineReport;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unroutable task: {0}")]
    UnroutableTask(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Partial engine failure: {}", .0.summary())]
    PartialEngineFailure(EngineReport),
    #[error("Task lock held elsewhere: {0}")]
    StaleLock(String),
    #[error("Task cancelled: {0}")]
    Cancelled(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("DOM smoothie error: {0}")]
    DomSmoothie(#[from] dom_smoothie::ReadabilityError),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

impl AppError {
    /// Whether the worker should schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::UnroutableTask(_)
                | AppError::Validation(_)
                | AppError::Cancelled(_)
                | AppError::NotFound(_)
                | AppError::Serialization(_)
        )
    }

    /// Short machine-readable code recorded alongside failed progress.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UnroutableTask(_) => "unroutable_task",
            AppError::Validation(_) => "validation",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::PartialEngineFailure(_) => "partial_engine_failure",
            AppError::StaleLock(_) => "stale_lock",
            AppError::Cancelled(_) => "cancelled",
            AppError::NotFound(_) => "not_found",
            _ => "processing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!AppError::UnroutableTask("x".into()).is_retryable());
        assert!(!AppError::Validation("x".into()).is_retryable());
        assert!(!AppError::Cancelled("x".into()).is_retryable());
        assert!(AppError::StoreUnavailable("x".into()).is_retryable());
        assert!(AppError::StaleLock("x".into()).is_retryable());
        assert!(AppError::PartialEngineFailure(EngineReport::default()).is_retryable());
    }
}
