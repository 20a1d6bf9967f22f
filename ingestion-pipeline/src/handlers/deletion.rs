//! Deletes that must stay consistent across the chunk store and every
//! retrieval engine. Engine failures surface as `PartialEngineFailure`.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        engine::EngineReport,
        task::{IndexDeletePayload, KbDeletePayload, KnowledgeListDeletePayload, TaskPayload, TaskType},
    },
};
use tracing::{info, warn};

use crate::{
    catalog::{TaskHandler, TaskRun},
    engines::into_result,
    graph::{cascaded_ids, delete_by_knowledge, delete_chunks, merge_relations, DeleteScope},
    progress::ProgressTracker,
    services::IngestionServices,
};

use super::{begin, misrouted, settle};

/// Storage prefix holding the source files of a knowledge item.
pub fn knowledge_storage_prefix(knowledge_id: &str) -> String {
    format!("knowledge/{knowledge_id}")
}

fn record_report(tracker: &mut ProgressTracker, report: &EngineReport) {
    let report = report.clone();
    tracker.annotate(|record| {
        record.success_count = report.succeeded.len();
        record.failed_count = report.failed.len();
        record.engine_report = Some(report);
    });
}

pub struct IndexDeleteHandler {
    services: Arc<IngestionServices>,
}

impl IndexDeleteHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    async fn delete(&self, payload: &IndexDeletePayload, tracker: &mut ProgressTracker) -> Result<String, AppError> {
        tracker.set_total(2);
        let deleted = delete_chunks(
            self.services.chunks.as_ref(),
            &payload.chunk_ids,
            DeleteScope::Document,
        )
        .await?;
        tracker
            .advance(1, format!("removed {} chunks", deleted.len()))
            .await?;

        // Children removed with their parents have index entries too, also
        // when an earlier attempt already tombstoned them.
        let mut ids = payload.chunk_ids.clone();
        merge_relations(&mut ids, &deleted);
        let cascaded = cascaded_ids(self.services.chunks.as_ref(), &payload.chunk_ids).await?;
        merge_relations(&mut ids, &cascaded);
        let report = self
            .services
            .engines
            .delete_by_chunk_ids(&payload.effective_engines, &ids)
            .await;
        record_report(tracker, &report);
        into_result(report)?;
        tracker.advance(2, "index entries removed").await?;

        info!(
            knowledge_base_id = %payload.knowledge_base_id,
            embedding_model_id = %payload.embedding_model_id,
            chunks = ids.len(),
            engines = payload.effective_engines.len(),
            "index entries deleted"
        );
        Ok(format!("deleted {} chunks from the index", ids.len()))
    }
}

#[async_trait]
impl TaskHandler for IndexDeleteHandler {
    fn task_type(&self) -> TaskType {
        TaskType::IndexDelete
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::IndexDelete(payload) = payload else {
            return Err(misrouted(TaskType::IndexDelete, &payload));
        };

        let mut tracker = begin(&self.services, run, TaskType::IndexDelete, &run.id, |_| true).await?;
        tracker.annotate(|record| record.knowledge_base_id = Some(payload.knowledge_base_id.clone()));
        let outcome = self.delete(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}

pub struct KbDeleteHandler {
    services: Arc<IngestionServices>,
}

impl KbDeleteHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    async fn delete(&self, payload: &KbDeletePayload, tracker: &mut ProgressTracker) -> Result<String, AppError> {
        tracker.set_total(2);
        let ids: Vec<String> = self
            .services
            .chunks
            .list_by_knowledge_base(&payload.knowledge_base_id)
            .await?
            .into_iter()
            .map(|chunk| chunk.id)
            .collect();
        let removed = self.services.chunks.soft_delete(&ids).await?;
        tracker.advance(1, format!("removed {removed} chunks")).await?;

        let report = self
            .services
            .engines
            .delete_by_knowledge_base(&payload.effective_engines, &payload.knowledge_base_id)
            .await;
        record_report(tracker, &report);
        into_result(report)?;
        tracker.advance(2, "index entries removed").await?;

        info!(knowledge_base_id = %payload.knowledge_base_id, chunks = removed, "knowledge base deleted");
        Ok(format!("deleted knowledge base with {removed} chunks"))
    }
}

#[async_trait]
impl TaskHandler for KbDeleteHandler {
    fn task_type(&self) -> TaskType {
        TaskType::KbDelete
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::KbDelete(payload) = payload else {
            return Err(misrouted(TaskType::KbDelete, &payload));
        };

        let mut tracker = begin(&self.services, run, TaskType::KbDelete, &run.id, |_| true).await?;
        tracker.annotate(|record| record.knowledge_base_id = Some(payload.knowledge_base_id.clone()));
        let outcome = self.delete(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}

/// Removes knowledge items: their chunks, index entries and stored files.
/// Running document tasks for those items are cancelled first.
pub struct KnowledgeListDeleteHandler {
    services: Arc<IngestionServices>,
}

impl KnowledgeListDeleteHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    async fn delete(
        &self,
        payload: &KnowledgeListDeletePayload,
        tracker: &mut ProgressTracker,
    ) -> Result<String, AppError> {
        let total = payload.knowledge_ids.len();
        tracker.set_total(total + 1);

        let mut chunk_count = 0usize;
        for (position, knowledge_id) in payload.knowledge_ids.iter().enumerate() {
            if self.services.cancellations.cancel(knowledge_id).await {
                info!(%knowledge_id, "cancelled running document task");
            }
            chunk_count += delete_by_knowledge(self.services.chunks.as_ref(), knowledge_id)
                .await?
                .len();

            let prefix = knowledge_storage_prefix(knowledge_id);
            if let Err(err) = self.services.storage.delete_prefix(&prefix).await {
                warn!(%knowledge_id, %prefix, error = %err, "could not remove stored files");
            }
            tracker
                .advance(position + 1, format!("removed {} of {total} knowledge items", position + 1))
                .await?;
        }

        let engines = self.services.engines.defaults().to_vec();
        let report = self
            .services
            .engines
            .delete_by_knowledge_ids(&engines, &payload.knowledge_ids)
            .await;
        record_report(tracker, &report);
        into_result(report)?;
        tracker.advance(total + 1, "index entries removed").await?;

        info!(knowledge = total, chunks = chunk_count, "knowledge items deleted");
        Ok(format!("deleted {total} knowledge items"))
    }
}

#[async_trait]
impl TaskHandler for KnowledgeListDeleteHandler {
    fn task_type(&self) -> TaskType {
        TaskType::KnowledgeListDelete
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::KnowledgeListDelete(payload) = payload else {
            return Err(misrouted(TaskType::KnowledgeListDelete, &payload));
        };

        let mut tracker = begin(&self.services, run, TaskType::KnowledgeListDelete, &run.id, |_| true).await?;
        let outcome = self.delete(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}
