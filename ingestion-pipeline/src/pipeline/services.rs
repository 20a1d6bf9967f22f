use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::Chunk,
        engine::EngineReport,
        task::{
            DocumentProcessPayload, QuestionGenerationPayload, SummaryGenerationPayload,
            TaskPayload,
        },
    },
};
use tracing::{debug, warn};

use crate::{
    graph::replace_document_chunks,
    reader::{ParsedDocument, ReadConfig},
    services::IngestionServices,
};

/// Side-effecting collaborators of the document pipeline.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn load_document(
        &self,
        payload: &DocumentProcessPayload,
        read_config: &ReadConfig,
    ) -> Result<ParsedDocument, AppError>;

    /// Persist the chunk set and return it with the ids of chunks it replaced.
    async fn store_chunks(
        &self,
        knowledge_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(Vec<Chunk>, Vec<String>), AppError>;

    async fn index_chunks(&self, chunks: Vec<Chunk>) -> Result<(Vec<Chunk>, EngineReport), AppError>;

    async fn schedule_followups(
        &self,
        payload: &DocumentProcessPayload,
    ) -> Result<Vec<String>, AppError>;
}

pub struct DefaultPipelineServices {
    services: Arc<IngestionServices>,
}

impl DefaultPipelineServices {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn load_document(
        &self,
        payload: &DocumentProcessPayload,
        read_config: &ReadConfig,
    ) -> Result<ParsedDocument, AppError> {
        let title = payload.file_name.clone().unwrap_or_default();

        if !payload.passages.is_empty() {
            let text = payload.passages.join("\n\n");
            return crate::reader::parse_text(title, &text, read_config);
        }

        if let Some(file_path) = payload.file_path.as_deref() {
            let content = self.services.storage.get(file_path).await.map_err(|err| match err {
                object_store::Error::NotFound { .. } => {
                    AppError::Validation(format!("source file {file_path} does not exist"))
                }
                other => AppError::ObjectStore(other),
            })?;
            let file_name = payload.file_name.as_deref().unwrap_or(file_path);
            let file_type = payload
                .file_type
                .clone()
                .or_else(|| {
                    file_name
                        .rsplit_once('.')
                        .map(|(_, extension)| extension.to_string())
                })
                .unwrap_or_default();
            return self
                .services
                .reader
                .read_from_file(content, file_name, &file_type, read_config)
                .await;
        }

        if let Some(url) = payload.url.as_deref() {
            return self
                .services
                .reader
                .read_from_url(url, &title, read_config)
                .await;
        }

        Err(AppError::Validation(format!(
            "document {} has no passages, file or url",
            payload.knowledge_id
        )))
    }

    async fn store_chunks(
        &self,
        knowledge_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(Vec<Chunk>, Vec<String>), AppError> {
        let (stored, stale) =
            replace_document_chunks(self.services.chunks.as_ref(), knowledge_id, chunks).await?;

        if !stale.is_empty() {
            let engines = self.services.engines.defaults().to_vec();
            let report = self
                .services
                .engines
                .delete_by_chunk_ids(&engines, &stale)
                .await;
            if !report.is_complete() {
                warn!(knowledge_id, report = %report.summary(), "could not purge replaced chunks from every engine");
            }
        }
        Ok((stored, stale))
    }

    async fn index_chunks(&self, chunks: Vec<Chunk>) -> Result<(Vec<Chunk>, EngineReport), AppError> {
        self.services.index_chunks(chunks).await
    }

    async fn schedule_followups(
        &self,
        payload: &DocumentProcessPayload,
    ) -> Result<Vec<String>, AppError> {
        let mut scheduled = Vec::new();

        if payload.enable_question_generation && payload.question_count > 0 {
            let id = self
                .services
                .enqueue(&TaskPayload::QuestionGeneration(QuestionGenerationPayload {
                    tenant_id: payload.tenant_id,
                    knowledge_base_id: payload.knowledge_base_id.clone(),
                    knowledge_id: payload.knowledge_id.clone(),
                    question_count: payload.question_count,
                }))
                .await?;
            scheduled.push(id);
        }

        let id = self
            .services
            .enqueue(&TaskPayload::SummaryGeneration(SummaryGenerationPayload {
                tenant_id: payload.tenant_id,
                knowledge_base_id: payload.knowledge_base_id.clone(),
                knowledge_id: payload.knowledge_id.clone(),
            }))
            .await?;
        scheduled.push(id);

        debug!(knowledge_id = %payload.knowledge_id, count = scheduled.len(), "follow-up tasks scheduled");
        Ok(scheduled)
    }
}
