use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::{deterministic_id, Chunk, ChunkStatus, ChunkType},
        task::{SummaryGenerationPayload, TaskPayload, TaskType},
    },
};
use serde::Deserialize;
use tracing::info;

use crate::{
    catalog::{TaskHandler, TaskRun},
    pipeline::IngestionTuning,
    progress::ProgressTracker,
    services::IngestionServices,
    utils::{
        llm_instructions::{summary_schema, SUMMARY_SYSTEM_MESSAGE},
        structured_completion,
    },
};

use super::{begin, misrouted, settle};

#[derive(Debug, Deserialize)]
struct GeneratedSummary {
    summary: String,
}

pub fn summary_chunk_id(knowledge_id: &str) -> String {
    deterministic_id(&[knowledge_id, "summary"])
}

/// Opening text of a knowledge item: the first `chunk_limit` text chunks in
/// order, cut at `max_chars` characters.
pub(crate) fn opening_text(chunks: &[Chunk], chunk_limit: usize, max_chars: usize) -> String {
    let mut text: Vec<&Chunk> = chunks
        .iter()
        .filter(|chunk| chunk.chunk_type == ChunkType::Text)
        .collect();
    text.sort_by_key(|chunk| chunk.chunk_index);

    let joined = text
        .iter()
        .take(chunk_limit)
        .map(|chunk| chunk.content.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    joined.chars().take(max_chars).collect()
}

pub struct SummaryGenerationHandler {
    services: Arc<IngestionServices>,
    tuning: IngestionTuning,
}

impl SummaryGenerationHandler {
    pub fn new(services: Arc<IngestionServices>, tuning: IngestionTuning) -> Self {
        Self { services, tuning }
    }

    async fn summarise(
        &self,
        payload: &SummaryGenerationPayload,
        tracker: &mut ProgressTracker,
    ) -> Result<String, AppError> {
        tracker.set_total(2);
        let chunks = self
            .services
            .chunks
            .list_by_knowledge(&payload.knowledge_id)
            .await?;
        let text = opening_text(
            &chunks,
            self.tuning.summary_chunk_limit,
            self.tuning.summary_max_chars,
        );
        if text.trim().is_empty() {
            return Ok("nothing to summarise".into());
        }

        let reply: GeneratedSummary = structured_completion(
            self.services.chat.as_ref(),
            SUMMARY_SYSTEM_MESSAGE,
            text,
            "document_summary",
            summary_schema(),
        )
        .await?;
        let summary = reply.summary.trim();
        if summary.is_empty() {
            return Err(AppError::LLMParsing("empty summary".into()));
        }
        tracker.advance(1, "summary generated").await?;

        let mut chunk = Chunk::new(
            summary_chunk_id(&payload.knowledge_id),
            payload.tenant_id,
            &payload.knowledge_base_id,
            &payload.knowledge_id,
            ChunkType::Summary,
            summary.to_string(),
        );
        chunk.advance_status(ChunkStatus::Stored);
        let stored = self.services.chunks.upsert(chunk).await?;

        let (_, report) = self.services.index_chunks(vec![stored]).await?;
        tracker.annotate(|record| {
            record.success_count = 1;
            record.engine_report = Some(report);
        });
        tracker.advance(2, "summary indexed").await?;

        info!(knowledge_id = %payload.knowledge_id, chars = summary.chars().count(), "summary stored");
        Ok("summary generated".into())
    }
}

#[async_trait]
impl TaskHandler for SummaryGenerationHandler {
    fn task_type(&self) -> TaskType {
        TaskType::SummaryGeneration
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::SummaryGeneration(payload) = payload else {
            return Err(misrouted(TaskType::SummaryGeneration, &payload));
        };

        let mut tracker = begin(&self.services, run, TaskType::SummaryGeneration, &run.id, |_| true).await?;
        tracker.annotate(|record| {
            record.knowledge_base_id = Some(payload.knowledge_base_id.clone());
            record.knowledge_id = Some(payload.knowledge_id.clone());
        });
        let outcome = self.summarise(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::progress::ProgressStatus;

    use crate::test_support::{harness, ScriptedChat};

    fn text_chunk(index: usize, content: &str) -> Chunk {
        let mut chunk = Chunk::new(
            format!("c-{index}"),
            1,
            "kb-1",
            "k-1",
            ChunkType::Text,
            content.to_string(),
        );
        chunk.chunk_index = index;
        chunk
    }

    fn payload() -> TaskPayload {
        TaskPayload::SummaryGeneration(SummaryGenerationPayload {
            tenant_id: 1,
            knowledge_base_id: "kb-1".into(),
            knowledge_id: "k-1".into(),
        })
    }

    #[test]
    fn opening_text_is_ordered_and_bounded() {
        let chunks = vec![
            text_chunk(2, "third"),
            text_chunk(0, "first"),
            text_chunk(1, "second"),
        ];
        assert_eq!(opening_text(&chunks, 2, 100), "first\n\nsecond");
        assert_eq!(opening_text(&chunks, 3, 8), "first\n\ns");
    }

    #[tokio::test]
    async fn stores_one_summary_chunk_per_knowledge() {
        let h = harness(ScriptedChat::with_replies([
            r#"{"summary": "A note about ownership."}"#,
            r#"{"summary": "A better note about ownership."}"#,
        ]));
        h.services
            .chunks
            .upsert_many(vec![text_chunk(0, "Ownership moves values."), text_chunk(1, "Borrowing shares them.")])
            .await
            .expect("seed");
        let handler = SummaryGenerationHandler::new(Arc::clone(&h.services), IngestionTuning::default());

        handler.handle(&TaskRun::new("s-1", 1), payload()).await.expect("first");
        handler.handle(&TaskRun::new("s-2", 1), payload()).await.expect("second");

        let summaries: Vec<Chunk> = h
            .services
            .chunks
            .list_by_knowledge("k-1")
            .await
            .expect("list")
            .into_iter()
            .filter(|chunk| chunk.chunk_type == ChunkType::Summary)
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].content, "A better note about ownership.");
        assert_eq!(summaries[0].status, ChunkStatus::Indexed);
        assert_eq!(h.keywords.entries_for_chunk(&summary_chunk_id("k-1")).await.len(), 1);

        let prompt = h.chat.calls.lock().await;
        assert!(prompt[0][1].content.contains("Ownership moves values."));
    }

    #[tokio::test]
    async fn knowledge_without_text_completes_without_calling_the_model() {
        let h = harness(ScriptedChat::new());
        let handler = SummaryGenerationHandler::new(Arc::clone(&h.services), IngestionTuning::default());

        handler.handle(&TaskRun::new("s-1", 1), payload()).await.expect("nothing to do");

        assert_eq!(h.chat.call_count().await, 0);
        let record = h.services.progress.get_progress("s-1").await.expect("progress");
        assert_eq!(record.status, ProgressStatus::Completed);
    }
}
