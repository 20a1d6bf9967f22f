use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::{deterministic_id, Chunk, ChunkMetadata, ChunkType, DocumentChunkMetadata, GeneratedQuestion},
        task::{QuestionGenerationPayload, TaskPayload, TaskType},
    },
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    catalog::{TaskHandler, TaskRun},
    progress::ProgressTracker,
    services::IngestionServices,
    utils::{
        llm_instructions::{question_generation_schema, QUESTION_GENERATION_SYSTEM_MESSAGE},
        structured_completion,
    },
};

use super::{begin, misrouted, settle};

#[derive(Debug, Deserialize)]
struct GeneratedQuestions {
    questions: Vec<String>,
}

pub struct QuestionGenerationHandler {
    services: Arc<IngestionServices>,
}

impl QuestionGenerationHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    async fn questions_for(&self, chunk: &Chunk, count: usize) -> Result<Vec<GeneratedQuestion>, AppError> {
        let user = format!(
            "Number of questions: {count}\n\nPassage:\n{}",
            chunk.content
        );
        let reply: GeneratedQuestions = structured_completion(
            self.services.chat.as_ref(),
            QUESTION_GENERATION_SYSTEM_MESSAGE,
            user,
            "generated_questions",
            question_generation_schema(),
        )
        .await?;

        let mut seen = HashSet::new();
        Ok(reply
            .questions
            .iter()
            .map(|question| question.trim())
            .filter(|question| !question.is_empty() && seen.insert(question.to_string()))
            .take(count)
            .map(|question| GeneratedQuestion {
                id: deterministic_id(&[chunk.id.as_str(), "question", question]),
                question: question.to_string(),
            })
            .collect())
    }

    async fn generate(
        &self,
        payload: &QuestionGenerationPayload,
        tracker: &mut ProgressTracker,
    ) -> Result<String, AppError> {
        let chunks: Vec<Chunk> = self
            .services
            .chunks
            .list_by_knowledge(&payload.knowledge_id)
            .await?
            .into_iter()
            .filter(|chunk| chunk.chunk_type == ChunkType::Text && chunk.is_enabled)
            .collect();
        tracker.set_total(chunks.len());
        tracker.save().await?;

        let mut updated = Vec::new();
        for (position, mut chunk) in chunks.into_iter().enumerate() {
            let done = chunk
                .document_metadata()
                .is_some_and(|meta| !meta.generated_questions.is_empty());
            if done {
                debug!(chunk_id = %chunk.id, "questions already generated");
            } else {
                let questions = self.questions_for(&chunk, payload.question_count).await?;
                chunk.metadata = Some(ChunkMetadata::Document(DocumentChunkMetadata {
                    generated_questions: questions,
                }));
                chunk = self.services.chunks.upsert(chunk).await?;
                updated.push(chunk);
            }
            tracker
                .advance(position + 1, format!("generated questions for {} chunks", position + 1))
                .await?;
        }

        if updated.is_empty() {
            return Ok("no chunks needed questions".into());
        }

        // Older question entries for these chunks would otherwise linger.
        let ids: Vec<String> = updated.iter().map(|chunk| chunk.id.clone()).collect();
        let engines = self.services.engines.defaults().to_vec();
        crate::engines::into_result(
            self.services.engines.delete_by_chunk_ids(&engines, &ids).await,
        )?;
        let (indexed, report) = self.services.index_chunks(updated).await?;
        tracker.annotate(|record| {
            record.success_count = indexed.len();
            record.engine_report = Some(report);
        });

        info!(
            knowledge_id = %payload.knowledge_id,
            chunks = indexed.len(),
            "generated questions indexed"
        );
        Ok(format!("generated questions for {} chunks", indexed.len()))
    }
}

#[async_trait]
impl TaskHandler for QuestionGenerationHandler {
    fn task_type(&self) -> TaskType {
        TaskType::QuestionGeneration
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::QuestionGeneration(payload) = payload else {
            return Err(misrouted(TaskType::QuestionGeneration, &payload));
        };
        if payload.question_count == 0 {
            return Err(AppError::Validation("question_count must be positive".into()));
        }

        let mut tracker = begin(&self.services, run, TaskType::QuestionGeneration, &run.id, |_| true).await?;
        tracker.annotate(|record| {
            record.knowledge_base_id = Some(payload.knowledge_base_id.clone());
            record.knowledge_id = Some(payload.knowledge_id.clone());
        });
        let outcome = self.generate(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}
