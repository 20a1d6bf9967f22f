use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::task::{DocumentProcessPayload, TaskPayload, TaskType},
};
use tracing::info;

use crate::{
    catalog::{TaskHandler, TaskRun},
    pipeline::{IngestionConfig, IngestionPipeline},
    reader::ReadConfig,
    services::IngestionServices,
};

use super::{begin, misrouted, settle};

/// Turns one document into indexed chunks, superseding any earlier run for
/// the same knowledge item.
pub struct DocumentProcessHandler {
    services: Arc<IngestionServices>,
    pipeline: IngestionPipeline,
}

impl DocumentProcessHandler {
    pub fn new(services: Arc<IngestionServices>, pipeline_config: IngestionConfig) -> Self {
        let pipeline = IngestionPipeline::new_with_config(Arc::clone(&services), pipeline_config);
        Self { services, pipeline }
    }

    pub fn with_pipeline(services: Arc<IngestionServices>, pipeline: IngestionPipeline) -> Self {
        Self { services, pipeline }
    }

    async fn run(&self, run: &TaskRun, payload: DocumentProcessPayload) -> Result<(), AppError> {
        if payload.knowledge_id.trim().is_empty() || payload.knowledge_base_id.trim().is_empty() {
            return Err(AppError::Validation(
                "document task requires knowledge_id and knowledge_base_id".into(),
            ));
        }
        let progress_id = if payload.request_id.is_empty() {
            run.id.clone()
        } else {
            payload.request_id.clone()
        };

        let cancel = self
            .services
            .cancellations
            .register(&payload.knowledge_id, &run.id)
            .await;

        let result = async {
            let mut tracker = begin(
                &self.services,
                run,
                TaskType::DocumentProcess,
                &progress_id,
                |_| true,
            )
            .await?;
            tracker.annotate(|record| {
                record.knowledge_base_id = Some(payload.knowledge_base_id.clone());
                record.knowledge_id = Some(payload.knowledge_id.clone());
            });

            let read_config =
                ReadConfig::from_app_config(&self.services.config, payload.enable_multimodel);
            let outcome = self
                .pipeline
                .process(&run.id, run.attempt, &payload, read_config, &mut tracker, &cancel)
                .await;

            let outcome = outcome.map(|outcome| {
                tracker.annotate(|record| {
                    record.success_count = outcome.chunk_count;
                    record.engine_report = Some(outcome.report.clone());
                });
                info!(
                    task_id = %run.id,
                    knowledge_id = %payload.knowledge_id,
                    chunks = outcome.chunk_count,
                    replaced = outcome.replaced_chunk_ids.len(),
                    followups = outcome.followup_task_ids.len(),
                    "document processed"
                );
                format!("processed {} chunks", outcome.chunk_count)
            });
            settle(tracker, outcome).await
        }
        .await;

        self.services
            .cancellations
            .finish(&payload.knowledge_id, &run.id)
            .await;
        result
    }
}

#[async_trait]
impl TaskHandler for DocumentProcessHandler {
    fn task_type(&self) -> TaskType {
        TaskType::DocumentProcess
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        match payload {
            TaskPayload::DocumentProcess(payload) => self.run(run, payload).await,
            other => Err(misrouted(TaskType::DocumentProcess, &other)),
        }
    }
}
