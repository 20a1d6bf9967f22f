//! Task routing: every task type maps to exactly one handler.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    error::AppError,
    storage::types::task::{FaqImportPayload, TaskEnvelope, TaskPayload, TaskType},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    faq::entries_location,
    handlers::{
        clone::KbCloneHandler,
        deletion::{IndexDeleteHandler, KbDeleteHandler, KnowledgeListDeleteHandler},
        document::DocumentProcessHandler,
        extract::ChunkExtractHandler,
        faq_import::FaqImportHandler,
        questions::QuestionGenerationHandler,
        summary::SummaryGenerationHandler,
        table::DataTableSummaryHandler,
    },
    pipeline::IngestionConfig,
    services::IngestionServices,
};

/// Identity of one delivery of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub id: String,
    pub attempt: u32,
}

impl TaskRun {
    pub fn new(id: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: id.into(),
            attempt,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError>;
}

pub struct TaskCatalog {
    services: Arc<IngestionServices>,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl TaskCatalog {
    /// A catalog without handlers. Dispatching anything yields `UnroutableTask`.
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self {
            services,
            handlers: HashMap::new(),
        }
    }

    pub fn with_default_handlers(
        services: Arc<IngestionServices>,
        pipeline_config: IngestionConfig,
    ) -> Self {
        let tuning = pipeline_config.tuning.clone();
        let mut catalog = Self::new(Arc::clone(&services));
        catalog.register(Arc::new(DocumentProcessHandler::new(
            Arc::clone(&services),
            pipeline_config,
        )));
        catalog.register(Arc::new(FaqImportHandler::new(Arc::clone(&services))));
        catalog.register(Arc::new(QuestionGenerationHandler::new(Arc::clone(&services))));
        catalog.register(Arc::new(SummaryGenerationHandler::new(
            Arc::clone(&services),
            tuning.clone(),
        )));
        catalog.register(Arc::new(ChunkExtractHandler::new(Arc::clone(&services))));
        catalog.register(Arc::new(DataTableSummaryHandler::new(
            Arc::clone(&services),
            tuning,
        )));
        catalog.register(Arc::new(KbCloneHandler::new(Arc::clone(&services))));
        catalog.register(Arc::new(IndexDeleteHandler::new(Arc::clone(&services))));
        catalog.register(Arc::new(KbDeleteHandler::new(Arc::clone(&services))));
        catalog.register(Arc::new(KnowledgeListDeleteHandler::new(services)));
        catalog
    }

    /// Register a handler, replacing any earlier one for the same type.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type(), handler);
    }

    pub fn services(&self) -> &Arc<IngestionServices> {
        &self.services
    }

    pub fn handles(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Serialize `payload` into an envelope and push it. Returns the task id.
    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<String, AppError> {
        if !self.handles(payload.task_type()) {
            return Err(AppError::UnroutableTask(format!(
                "no handler registered for {}",
                payload.task_type()
            )));
        }
        self.services.enqueue(payload).await
    }

    /// Enqueue an FAQ import. Entry lists above the inline threshold are
    /// moved to object storage and referenced by `entries_url`. An empty
    /// `task_id` gets a fresh one so storage locations never collide.
    pub async fn enqueue_faq_import(
        &self,
        mut payload: FaqImportPayload,
    ) -> Result<String, AppError> {
        if payload.task_id.trim().is_empty() {
            payload.task_id = Uuid::new_v4().to_string();
        }
        if payload.enqueued_at == 0 {
            payload.enqueued_at = Utc::now().timestamp_millis();
        }

        if !payload.entries.is_empty() {
            let serialized = serde_json::to_vec(&payload.entries)?;
            if serialized.len() > self.services.config.faq_inline_payload_bytes {
                let location = entries_location(&payload.task_id);
                self.services
                    .storage
                    .put(&location, bytes::Bytes::from(serialized))
                    .await?;
                info!(
                    task_id = %payload.task_id,
                    entries = payload.entries.len(),
                    %location,
                    "faq entries offloaded to object storage"
                );
                payload.entry_count = payload.entries.len();
                payload.entries_url = Some(location);
                payload.entries = Vec::new();
            } else {
                payload.entry_count = payload.entries.len();
            }
        }

        self.enqueue(&TaskPayload::FaqImport(payload)).await
    }

    /// Decode the envelope and hand it to its handler.
    pub async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<(), AppError> {
        let payload = envelope.decode()?;
        let task_type = payload.task_type();
        let handler = self.handlers.get(&task_type).ok_or_else(|| {
            AppError::UnroutableTask(format!("no handler registered for {task_type}"))
        })?;

        debug!(task_id = %envelope.id, %task_type, attempt = envelope.attempts, "dispatching task");
        handler
            .handle(&TaskRun::new(envelope.id.clone(), envelope.attempts), payload)
            .await
    }
}
