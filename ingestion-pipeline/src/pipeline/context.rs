use common::{
    error::AppError,
    storage::types::{chunk::Chunk, engine::EngineReport, task::DocumentProcessPayload},
};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    cancellation::ensure_active,
    progress::ProgressTracker,
    reader::{ParsedDocument, ReadConfig},
};

use super::{config::IngestionConfig, services::PipelineServices};

pub struct PipelineContext<'a> {
    pub payload: &'a DocumentProcessPayload,
    pub task_id: String,
    pub attempt: u32,
    pub pipeline_config: &'a IngestionConfig,
    pub services: &'a dyn PipelineServices,
    pub read_config: ReadConfig,
    pub tracker: &'a mut ProgressTracker,
    pub cancel: &'a CancellationToken,
    pub document: Option<ParsedDocument>,
    pub chunks: Vec<Chunk>,
    pub stale_chunk_ids: Vec<String>,
    pub report: EngineReport,
}

impl<'a> PipelineContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: &str,
        attempt: u32,
        payload: &'a DocumentProcessPayload,
        read_config: ReadConfig,
        pipeline_config: &'a IngestionConfig,
        services: &'a dyn PipelineServices,
        tracker: &'a mut ProgressTracker,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            payload,
            task_id: task_id.to_string(),
            attempt,
            pipeline_config,
            services,
            read_config,
            tracker,
            cancel,
            document: None,
            chunks: Vec::new(),
            stale_chunk_ids: Vec::new(),
            report: EngineReport::default(),
        }
    }

    pub fn take_document(&mut self) -> Result<ParsedDocument, AppError> {
        self.document.take().ok_or_else(|| {
            AppError::InternalError("parsed document expected to be available".into())
        })
    }

    /// Bail out if a newer run superseded this one, otherwise record the step.
    pub async fn checkpoint(&mut self, step: usize, message: &str) -> Result<(), AppError> {
        ensure_active(self.cancel, &self.task_id)?;
        self.tracker.advance(step, message).await
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            task_id = %self.task_id,
            attempt = self.attempt,
            knowledge_id = %self.payload.knowledge_id,
            error = %err,
            "document pipeline aborted"
        );
        err
    }
}
