use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::ChunkStatus,
        engine::EngineReport,
        task::{KbClonePayload, TaskPayload, TaskType},
    },
};
use tracing::{debug, info};

use crate::{
    catalog::{TaskHandler, TaskRun},
    engines::{into_result, IndexCopy},
    graph::{cloned_chunk_id, remap_for_clone},
    progress::ProgressTracker,
    services::IngestionServices,
};

use super::{begin, misrouted, settle};

/// Copies every knowledge item of one knowledge base into another, reusing
/// the stored embeddings instead of re-indexing.
pub struct KbCloneHandler {
    services: Arc<IngestionServices>,
}

impl KbCloneHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    async fn clone_knowledge(
        &self,
        payload: &KbClonePayload,
        knowledge_id: &str,
    ) -> Result<(usize, EngineReport), AppError> {
        let store = self.services.chunks.as_ref();
        let sources = store.list_by_knowledge(knowledge_id).await?;
        if sources.is_empty() {
            return Ok((0, EngineReport::default()));
        }

        let was_indexed: HashMap<String, bool> = sources
            .iter()
            .map(|c| {
                (
                    cloned_chunk_id(&payload.target_id, &c.id),
                    c.status == ChunkStatus::Indexed,
                )
            })
            .collect();
        let copies = remap_for_clone(&sources, &payload.target_id);
        let index_copies: Vec<IndexCopy> = sources
            .iter()
            .zip(&copies)
            .map(|(source, copy)| IndexCopy {
                source_chunk_id: source.id.clone(),
                target_chunk_id: copy.id.clone(),
                target_knowledge_id: copy.knowledge_id.clone(),
            })
            .collect();

        store.upsert_many(copies.clone()).await?;
        let engines = self.services.engines.defaults().to_vec();
        let report = into_result(
            self.services
                .engines
                .copy_indices(&engines, &payload.target_id, &index_copies)
                .await,
        )?;

        let indexed: Vec<_> = copies
            .into_iter()
            .filter(|c| was_indexed.get(&c.id).copied().unwrap_or(false))
            .map(|mut c| {
                c.advance_status(ChunkStatus::Indexed);
                c
            })
            .collect();
        let count = index_copies.len();
        store.upsert_many(indexed).await?;
        debug!(knowledge_id, chunks = count, "knowledge cloned");
        Ok((count, report))
    }

    async fn clone_base(
        &self,
        payload: &KbClonePayload,
        tracker: &mut ProgressTracker,
    ) -> Result<String, AppError> {
        let knowledge_ids = self
            .services
            .chunks
            .list_knowledge_ids(&payload.source_id)
            .await?;
        tracker.set_total(knowledge_ids.len());
        tracker.save().await?;

        // Items before `processed` were copied by an earlier delivery.
        let resume_from = tracker.record().processed.min(knowledge_ids.len());
        let mut chunk_total = 0usize;
        let mut report = EngineReport::default();
        for (position, knowledge_id) in knowledge_ids.iter().enumerate().skip(resume_from) {
            let (count, knowledge_report) = self.clone_knowledge(payload, knowledge_id).await?;
            chunk_total += count;
            report.merge(knowledge_report);
            tracker
                .advance(
                    position + 1,
                    format!("cloned {} of {} knowledge items", position + 1, knowledge_ids.len()),
                )
                .await?;
        }

        tracker.annotate(|record| {
            record.success_count = knowledge_ids.len();
            record.engine_report = Some(report);
        });
        info!(
            source = %payload.source_id,
            target = %payload.target_id,
            knowledge = knowledge_ids.len(),
            chunks = chunk_total,
            "knowledge base cloned"
        );
        Ok(format!("cloned {} knowledge items", knowledge_ids.len()))
    }
}

#[async_trait]
impl TaskHandler for KbCloneHandler {
    fn task_type(&self) -> TaskType {
        TaskType::KbClone
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::KbClone(payload) = payload else {
            return Err(misrouted(TaskType::KbClone, &payload));
        };
        if payload.source_id.is_empty() || payload.target_id.is_empty() {
            return Err(AppError::Validation("clone requires source and target".into()));
        }
        if payload.source_id == payload.target_id {
            return Err(AppError::Validation("clone source and target must differ".into()));
        }

        let progress_id = if payload.task_id.is_empty() {
            run.id.clone()
        } else {
            payload.task_id.clone()
        };
        let mut tracker = begin(&self.services, run, TaskType::KbClone, &progress_id, |_| true).await?;
        tracker.annotate(|record| {
            record.source_id = Some(payload.source_id.clone());
            record.target_id = Some(payload.target_id.clone());
        });
        let outcome = self.clone_base(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::{
        chunk::{Chunk, ChunkType},
        progress::ProgressStatus,
    };

    use crate::{
        graph::{cloned_knowledge_id, link_chain},
        test_support::{harness, ScriptedChat},
    };

    fn payload() -> TaskPayload {
        TaskPayload::KbClone(KbClonePayload {
            tenant_id: 1,
            task_id: "clone-1".into(),
            source_id: "kb-src".into(),
            target_id: "kb-dst".into(),
        })
    }

    #[tokio::test]
    async fn copies_chunks_and_index_entries() {
        let h = harness(ScriptedChat::new());
        let mut chunks: Vec<Chunk> = (0..2)
            .map(|i| {
                let mut chunk = Chunk::new(
                    format!("c-{i}"),
                    1,
                    "kb-src",
                    "k-1",
                    ChunkType::Text,
                    format!("passage {i}"),
                );
                chunk.chunk_index = i;
                chunk.advance_status(ChunkStatus::Stored);
                chunk
            })
            .collect();
        link_chain(&mut chunks);
        let stored = h.services.chunks.upsert_many(chunks).await.expect("seed");
        h.services.index_chunks(stored).await.expect("index source");

        let handler = KbCloneHandler::new(Arc::clone(&h.services));
        handler.handle(&TaskRun::new("run-1", 1), payload()).await.expect("clone");

        let target_knowledge = cloned_knowledge_id("kb-dst", "k-1");
        let copies = h
            .services
            .chunks
            .list_by_knowledge(&target_knowledge)
            .await
            .expect("list");
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|c| c.knowledge_base_id == "kb-dst"));
        assert!(copies.iter().all(|c| c.status == ChunkStatus::Indexed));
        assert_eq!(copies[0].next_chunk_id.as_deref(), Some(copies[1].id.as_str()));
        assert_eq!(h.keywords.len().await, 4);
        assert_eq!(h.vector.entries_for_chunk(&copies[0].id).await.len(), 1);

        let record = h.services.progress.get_progress("clone-1").await.expect("progress");
        assert_eq!(record.status, ProgressStatus::Completed);
        assert_eq!(record.source_id.as_deref(), Some("kb-src"));
        assert_eq!(record.total, 1);
    }

    #[tokio::test]
    async fn failing_engine_fails_the_clone() {
        let h = harness(ScriptedChat::new());
        h.services
            .chunks
            .upsert(Chunk::new("c-0".into(), 1, "kb-src", "k-1", ChunkType::Text, "text".into()))
            .await
            .expect("seed");
        h.vector.set_failing(true);

        let handler = KbCloneHandler::new(Arc::clone(&h.services));
        let err = handler
            .handle(&TaskRun::new("run-1", 1), payload())
            .await
            .expect_err("engine down");
        let AppError::PartialEngineFailure(report) = err else {
            panic!("expected partial engine failure");
        };
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn cloning_into_itself_is_rejected() {
        let h = harness(ScriptedChat::new());
        let handler = KbCloneHandler::new(Arc::clone(&h.services));
        let err = handler
            .handle(
                &TaskRun::new("run-1", 1),
                TaskPayload::KbClone(KbClonePayload {
                    tenant_id: 1,
                    task_id: "clone-2".into(),
                    source_id: "kb".into(),
                    target_id: "kb".into(),
                }),
            )
            .await
            .expect_err("same kb");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
