use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::{deterministic_id, Chunk, ChunkMetadata, ChunkStatus, ChunkType, TableChunkMetadata},
        task::{DataTableSummaryPayload, TaskPayload, TaskType},
    },
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    catalog::{TaskHandler, TaskRun},
    engines::into_result,
    pipeline::IngestionTuning,
    progress::ProgressTracker,
    services::IngestionServices,
    utils::{
        llm_instructions::{table_summary_schema, TABLE_SUMMARY_SYSTEM_MESSAGE},
        structured_completion,
    },
};

use super::{begin, misrouted, settle, summary::opening_text};

#[derive(Debug, Deserialize)]
struct TableDescription {
    summary: String,
    #[serde(default)]
    columns: Vec<ColumnDescription>,
}

#[derive(Debug, Deserialize)]
struct ColumnDescription {
    name: String,
    #[serde(default)]
    column_type: String,
    #[serde(default)]
    description: String,
}

pub fn table_summary_chunk_id(knowledge_id: &str) -> String {
    deterministic_id(&[knowledge_id, "table_summary"])
}

pub fn table_column_chunk_id(knowledge_id: &str, column: &str) -> String {
    deterministic_id(&[knowledge_id, "table_column", column])
}

pub struct DataTableSummaryHandler {
    services: Arc<IngestionServices>,
    tuning: IngestionTuning,
}

impl DataTableSummaryHandler {
    pub fn new(services: Arc<IngestionServices>, tuning: IngestionTuning) -> Self {
        Self { services, tuning }
    }

    fn table_chunk(
        payload: &DataTableSummaryPayload,
        id: String,
        chunk_type: ChunkType,
        content: String,
        column: Option<&ColumnDescription>,
    ) -> Chunk {
        let mut chunk = Chunk::new(
            id,
            payload.tenant_id,
            &payload.knowledge_base_id,
            &payload.knowledge_id,
            chunk_type,
            content,
        );
        chunk.metadata = Some(ChunkMetadata::Table(TableChunkMetadata {
            table_name: payload.knowledge_id.clone(),
            column_name: column.map(|c| c.name.trim().to_string()),
            column_type: column.map(|c| c.column_type.trim().to_string()),
        }));
        chunk.advance_status(ChunkStatus::Stored);
        chunk
    }

    async fn describe(
        &self,
        payload: &DataTableSummaryPayload,
        tracker: &mut ProgressTracker,
    ) -> Result<String, AppError> {
        tracker.set_total(2);
        let existing = self
            .services
            .chunks
            .list_by_knowledge(&payload.knowledge_id)
            .await?;
        let sample = opening_text(
            &existing,
            self.tuning.summary_chunk_limit,
            self.tuning.summary_max_chars,
        );
        if sample.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "knowledge {} has no table content",
                payload.knowledge_id
            )));
        }

        let reply: TableDescription = structured_completion(
            self.services.chat.as_ref(),
            TABLE_SUMMARY_SYSTEM_MESSAGE,
            sample,
            "table_summary",
            table_summary_schema(),
        )
        .await?;
        tracker.advance(1, "table described").await?;

        let summary_id = table_summary_chunk_id(&payload.knowledge_id);
        let mut chunks = vec![Self::table_chunk(
            payload,
            summary_id.clone(),
            ChunkType::TableSummary,
            reply.summary.trim().to_string(),
            None,
        )];
        let mut seen = HashSet::new();
        for column in &reply.columns {
            let name = column.name.trim();
            if name.is_empty() || !seen.insert(name.to_string()) {
                continue;
            }
            let mut chunk = Self::table_chunk(
                payload,
                table_column_chunk_id(&payload.knowledge_id, name),
                ChunkType::TableColumn,
                format!(
                    "{name} ({}): {}",
                    column.column_type.trim(),
                    column.description.trim()
                ),
                Some(column),
            );
            chunk.parent_chunk_id = Some(summary_id.clone());
            chunks.push(chunk);
        }

        // Columns from an earlier description that are no longer present.
        let fresh: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = existing
            .iter()
            .filter(|c| c.chunk_type == ChunkType::TableColumn && !fresh.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();
        if !stale.is_empty() {
            debug!(knowledge_id = %payload.knowledge_id, stale = stale.len(), "dropping stale columns");
            self.services.chunks.soft_delete(&stale).await?;
            let engines = self.services.engines.defaults().to_vec();
            into_result(self.services.engines.delete_by_chunk_ids(&engines, &stale).await)?;
        }

        let column_count = chunks.len() - 1;
        let stored = self.services.chunks.upsert_many(chunks).await?;
        let (_, report) = self.services.index_chunks(stored).await?;
        tracker.annotate(|record| {
            record.success_count = column_count + 1;
            record.engine_report = Some(report);
        });
        tracker.advance(2, "table summary indexed").await?;

        info!(knowledge_id = %payload.knowledge_id, columns = column_count, "table summarised");
        Ok(format!("summarised table with {column_count} columns"))
    }
}

#[async_trait]
impl TaskHandler for DataTableSummaryHandler {
    fn task_type(&self) -> TaskType {
        TaskType::DataTableSummary
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::DataTableSummary(payload) = payload else {
            return Err(misrouted(TaskType::DataTableSummary, &payload));
        };

        let mut tracker = begin(&self.services, run, TaskType::DataTableSummary, &run.id, |_| true).await?;
        tracker.annotate(|record| {
            record.knowledge_base_id = Some(payload.knowledge_base_id.clone());
            record.knowledge_id = Some(payload.knowledge_id.clone());
        });
        let outcome = self.describe(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, ScriptedChat};

    fn payload() -> TaskPayload {
        TaskPayload::DataTableSummary(DataTableSummaryPayload {
            tenant_id: 1,
            knowledge_base_id: "kb-1".into(),
            knowledge_id: "sales".into(),
        })
    }

    #[tokio::test]
    async fn summary_and_columns_replace_earlier_description() {
        let h = harness(ScriptedChat::with_replies([
            r#"{"summary": "Monthly sales.", "columns": [
                {"name": "month", "column_type": "date", "description": "Sales month"},
                {"name": "region", "column_type": "text", "description": "Sales region"}]}"#,
            r#"{"summary": "Monthly sales per month.", "columns": [
                {"name": "month", "column_type": "date", "description": "Sales month"},
                {"name": "month", "column_type": "date", "description": "duplicate"}]}"#,
        ]));
        h.services
            .chunks
            .upsert(Chunk::new(
                "rows".into(),
                1,
                "kb-1",
                "sales",
                ChunkType::Text,
                "month,region\n2024-01,north\n2024-02,south".into(),
            ))
            .await
            .expect("seed");
        let handler = DataTableSummaryHandler::new(Arc::clone(&h.services), IngestionTuning::default());

        handler.handle(&TaskRun::new("t-1", 1), payload()).await.expect("first");
        let region = table_column_chunk_id("sales", "region");
        assert_eq!(h.vector.entries_for_chunk(&region).await.len(), 1);

        handler.handle(&TaskRun::new("t-2", 1), payload()).await.expect("second");

        let chunks = h.services.chunks.list_by_knowledge("sales").await.expect("list");
        let columns: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::TableColumn)
            .collect();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].content, "month (date): Sales month");
        assert_eq!(
            columns[0].parent_chunk_id.as_deref(),
            Some(table_summary_chunk_id("sales").as_str())
        );
        assert!(matches!(
            &columns[0].metadata,
            Some(ChunkMetadata::Table(meta)) if meta.column_type.as_deref() == Some("date")
        ));
        assert!(h.vector.entries_for_chunk(&region).await.is_empty());
    }

    #[tokio::test]
    async fn knowledge_without_rows_is_rejected() {
        let h = harness(ScriptedChat::new());
        let handler = DataTableSummaryHandler::new(Arc::clone(&h.services), IngestionTuning::default());

        let err = handler
            .handle(&TaskRun::new("t-1", 1), payload())
            .await
            .expect_err("no rows");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
