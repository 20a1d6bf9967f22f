use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkStatus, ChunkType},
        graph::{ChunkContext, GraphData, GraphNode},
        task::{ExtractChunkPayload, TaskPayload, TaskType},
    },
};
use tracing::{debug, info, instrument};

use crate::{
    catalog::{TaskHandler, TaskRun},
    graph::{link_relations, merge_relations, relationship_chunk_id, resolve_neighbors},
    progress::ProgressTracker,
    services::IngestionServices,
    utils::{
        llm_instructions::{graph_extraction_schema, GRAPH_EXTRACTION_SYSTEM_MESSAGE},
        structured_completion, GraphMapper,
    },
};

use super::{begin, misrouted, settle};

/// Builds entity and relationship chunks for one source chunk and links them
/// back to it.
pub struct ChunkExtractHandler {
    services: Arc<IngestionServices>,
}

impl ChunkExtractHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    #[instrument(level = "trace", skip_all, fields(chunk_id = %source.id))]
    async fn extract_graph(&self, source: &Chunk) -> Result<GraphData, AppError> {
        let (prev, next) = resolve_neighbors(self.services.chunks.as_ref(), source).await?;
        let context = ChunkContext {
            chunk_id: source.id.clone(),
            content: source.content.clone(),
            prev_content: prev.map(|c| c.content),
            next_content: next.map(|c| c.content),
        };

        let mut graph: GraphData = structured_completion(
            self.services.chat.as_ref(),
            GRAPH_EXTRACTION_SYSTEM_MESSAGE,
            serde_json::to_string(&context)?,
            "graph_extraction",
            graph_extraction_schema(),
        )
        .await?;
        graph.sanitize();
        graph.text.clone_from(&source.content);
        Ok(graph)
    }

    async fn entity_chunk(
        &self,
        source: &Chunk,
        node: &GraphNode,
        mapper: &mut GraphMapper,
    ) -> Result<Chunk, AppError> {
        let id = mapper.assign_id(&node.name);
        let attributes: Vec<&str> = node
            .attributes
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();

        let mut entity = match self.services.chunks.get(&id).await? {
            Some(existing) => existing,
            None => {
                let mut entity = Chunk::new(
                    id,
                    source.tenant_id,
                    &source.knowledge_base_id,
                    &source.knowledge_id,
                    ChunkType::Entity,
                    node.name.trim().to_string(),
                );
                entity.advance_status(ChunkStatus::Stored);
                entity
            }
        };

        for attribute in attributes {
            if !entity.content.lines().any(|line| line == attribute) {
                entity.content.push('\n');
                entity.content.push_str(attribute);
            }
        }
        merge_relations(&mut entity.relation_chunks, &[source.id.clone()]);
        entity.end_at = entity.content.chars().count();
        Ok(entity)
    }

    async fn build(&self, payload: &ExtractChunkPayload, tracker: &mut ProgressTracker) -> Result<String, AppError> {
        tracker.set_total(3);
        let store = self.services.chunks.as_ref();
        let source = store
            .get(&payload.chunk_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chunk {}", payload.chunk_id)))?;

        let graph = self.extract_graph(&source).await?;
        tracker
            .advance(1, format!("extracted {} entities", graph.node.len()))
            .await?;
        if graph.node.is_empty() {
            return Ok("no entities found".into());
        }

        let mut mapper = GraphMapper::new(source.knowledge_id.clone());
        let mut entities = Vec::with_capacity(graph.node.len());
        for node in &graph.node {
            entities.push(self.entity_chunk(&source, node, &mut mapper).await?);
        }

        let mut relationships = Vec::with_capacity(graph.relation.len());
        for relation in &graph.relation {
            let from = mapper.get_id(&relation.node1)?;
            let to = mapper.get_id(&relation.node2)?;
            let kind = relation.relation_type.trim();
            let mut chunk = Chunk::new(
                relationship_chunk_id(&source.knowledge_id, &relation.node1, &relation.node2, kind),
                source.tenant_id,
                &source.knowledge_base_id,
                &source.knowledge_id,
                ChunkType::Relationship,
                format!("{} {kind} {}", relation.node1.trim(), relation.node2.trim()),
            );
            chunk.relation_chunks = vec![from, to];
            chunk.advance_status(ChunkStatus::Stored);
            relationships.push(chunk);
        }

        let direct: Vec<String> = entities
            .iter()
            .chain(relationships.iter())
            .map(|chunk| chunk.id.clone())
            .collect();
        // Other passages that mention the same entities.
        let mut indirect = Vec::new();
        for entity in &entities {
            let others: Vec<String> = entity
                .relation_chunks
                .iter()
                .filter(|id| **id != source.id)
                .cloned()
                .collect();
            merge_relations(&mut indirect, &others);
        }

        let entity_count = entities.len();
        let relationship_count = relationships.len();
        let mut graph_chunks = entities;
        graph_chunks.extend(relationships);
        let stored = store.upsert_many(graph_chunks).await?;
        tracker.advance(2, "graph chunks stored").await?;

        let (_, report) = self.services.index_chunks(stored).await?;
        link_relations(store, &source.id, &direct, &indirect).await?;
        tracker.annotate(|record| {
            record.knowledge_base_id = Some(source.knowledge_base_id.clone());
            record.knowledge_id = Some(source.knowledge_id.clone());
            record.success_count = direct.len();
            record.engine_report = Some(report);
        });
        tracker.advance(3, "graph linked").await?;

        debug!(chunk_id = %source.id, indirect = indirect.len(), "relations linked");
        info!(
            chunk_id = %source.id,
            model_id = %payload.model_id,
            entities = entity_count,
            relationships = relationship_count,
            "graph extracted"
        );
        Ok(format!(
            "extracted {entity_count} entities and {relationship_count} relationships"
        ))
    }
}

#[async_trait]
impl TaskHandler for ChunkExtractHandler {
    fn task_type(&self) -> TaskType {
        TaskType::ChunkExtract
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::ChunkExtract(payload) = payload else {
            return Err(misrouted(TaskType::ChunkExtract, &payload));
        };

        let mut tracker = begin(&self.services, run, TaskType::ChunkExtract, &run.id, |_| true).await?;
        let outcome = self.build(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{entity_chunk_id, link_chain},
        test_support::{harness, ScriptedChat, TestHarness},
    };

    async fn seed(h: &TestHarness) {
        let mut chunks: Vec<Chunk> = ["Cargo builds Rust crates.", "Rust has no garbage collector."]
            .iter()
            .enumerate()
            .map(|(index, content)| {
                let mut chunk = Chunk::new(
                    format!("src-{index}"),
                    1,
                    "kb-1",
                    "k-1",
                    ChunkType::Text,
                    content.to_string(),
                );
                chunk.chunk_index = index;
                chunk
            })
            .collect();
        link_chain(&mut chunks);
        h.services.chunks.upsert_many(chunks).await.expect("seed");
    }

    fn payload(chunk_id: &str) -> TaskPayload {
        TaskPayload::ChunkExtract(ExtractChunkPayload {
            tenant_id: 1,
            chunk_id: chunk_id.into(),
            model_id: "chat-model".into(),
        })
    }

    #[tokio::test]
    async fn builds_entities_relationships_and_links() {
        let h = harness(ScriptedChat::with_replies([
            r#"{"node": [{"name": "Cargo", "attributes": ["build tool"]}, {"name": "Rust", "attributes": ["language"]}],
                "relation": [{"node1": "Cargo", "node2": "Rust", "type": "builds"}]}"#,
            r#"{"node": [{"name": "rust", "attributes": ["no garbage collector"]}], "relation": []}"#,
        ]));
        seed(&h).await;
        let handler = ChunkExtractHandler::new(Arc::clone(&h.services));

        handler.handle(&TaskRun::new("x-1", 1), payload("src-0")).await.expect("first");
        handler.handle(&TaskRun::new("x-2", 1), payload("src-1")).await.expect("second");

        let store = h.services.chunks.as_ref();
        let rust_id = entity_chunk_id("k-1", "Rust");
        let rust = store.get(&rust_id).await.expect("get").expect("entity");
        assert_eq!(rust.chunk_type, ChunkType::Entity);
        assert_eq!(rust.content, "Rust\nlanguage\nno garbage collector");
        assert_eq!(rust.relation_chunks, vec!["src-0".to_string(), "src-1".to_string()]);
        assert_eq!(rust.status, ChunkStatus::Indexed);

        let first = store.get("src-0").await.expect("get").expect("source");
        assert_eq!(first.relation_chunks.len(), 3);
        let relationship_id = relationship_chunk_id("k-1", "Cargo", "Rust", "builds");
        let relationship = store.get(&relationship_id).await.expect("get").expect("relationship");
        assert_eq!(relationship.content, "Cargo builds Rust");
        assert_eq!(
            relationship.relation_chunks,
            vec![entity_chunk_id("k-1", "Cargo"), rust_id.clone()]
        );

        let second = store.get("src-1").await.expect("get").expect("source");
        assert_eq!(second.relation_chunks, vec![rust_id]);
        assert_eq!(second.indirect_relation_chunks, vec!["src-0".to_string()]);

        // The prompt carries the neighbouring passage.
        let calls = h.chat.calls.lock().await;
        assert!(calls[0][1].content.contains("Rust has no garbage collector."));
    }

    #[tokio::test]
    async fn missing_source_chunk_is_not_found() {
        let h = harness(ScriptedChat::new());
        let handler = ChunkExtractHandler::new(Arc::clone(&h.services));

        let err = handler
            .handle(&TaskRun::new("x-1", 1), payload("nope"))
            .await
            .expect_err("missing chunk");
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.chat.call_count().await, 0);
    }
}
