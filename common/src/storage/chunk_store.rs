use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::AppError;

use super::types::chunk::{Chunk, ChunkType};

/// Primary persistence for chunks. Reads skip soft-deleted rows unless stated.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert or replace by id. New rows get the next `seq_id` unless one is supplied;
    /// replacing keeps the existing `seq_id` and `created_at`.
    async fn upsert(&self, chunk: Chunk) -> Result<Chunk, AppError>;

    async fn upsert_many(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, AppError> {
        let mut stored = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            stored.push(self.upsert(chunk).await?);
        }
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>, AppError>;

    /// Like `get`, but also returns tombstoned rows.
    async fn get_including_deleted(&self, id: &str) -> Result<Option<Chunk>, AppError>;

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Chunk>, AppError>;

    /// Live chunks of one knowledge item ordered by `chunk_index`.
    async fn list_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<Chunk>, AppError>;

    async fn list_by_knowledge_base(&self, knowledge_base_id: &str)
        -> Result<Vec<Chunk>, AppError>;

    async fn list_knowledge_ids(&self, knowledge_base_id: &str) -> Result<Vec<String>, AppError>;

    async fn list_children(&self, parent_chunk_id: &str) -> Result<Vec<Chunk>, AppError>;

    /// Like `list_children`, but also returns tombstoned rows.
    async fn list_children_including_deleted(
        &self,
        parent_chunk_id: &str,
    ) -> Result<Vec<Chunk>, AppError>;

    /// Chunks whose direct or indirect relation sets mention `chunk_id`.
    async fn list_referencing(&self, chunk_id: &str) -> Result<Vec<Chunk>, AppError>;

    async fn find_by_content_hash(
        &self,
        knowledge_id: &str,
        content_hash: &str,
    ) -> Result<Option<Chunk>, AppError>;

    /// Tombstone the given rows. Returns how many live rows were affected.
    async fn soft_delete(&self, ids: &[String]) -> Result<usize, AppError>;

    async fn restore(&self, ids: &[String]) -> Result<usize, AppError>;
}

#[derive(Default)]
struct ChunkTable {
    rows: HashMap<String, Chunk>,
    next_seq: i64,
}

impl ChunkTable {
    fn seq_taken(&self, seq_id: i64, except: &str) -> bool {
        self.rows
            .values()
            .any(|row| row.seq_id == seq_id && row.id != except)
    }

    fn allocate_seq(&mut self) -> i64 {
        self.next_seq = self.next_seq.saturating_add(1);
        self.next_seq
    }
}

#[derive(Default)]
pub struct InMemoryChunkStore {
    table: RwLock<ChunkTable>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ordered(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks.sort_by(|a, b| {
        a.chunk_index
            .cmp(&b.chunk_index)
            .then_with(|| a.seq_id.cmp(&b.seq_id))
    });
    chunks
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn upsert(&self, mut chunk: Chunk) -> Result<Chunk, AppError> {
        chunk.validate_metadata()?;
        let mut table = self.table.write().await;

        if let Some(existing) = table.rows.get(&chunk.id) {
            chunk.seq_id = existing.seq_id;
            chunk.created_at = existing.created_at;
        } else if chunk.seq_id > 0 {
            if table.seq_taken(chunk.seq_id, &chunk.id) {
                return Err(AppError::Validation(format!(
                    "seq_id {} already in use",
                    chunk.seq_id
                )));
            }
            table.next_seq = table.next_seq.max(chunk.seq_id);
        } else {
            chunk.seq_id = table.allocate_seq();
        }

        chunk.updated_at = Utc::now();
        table.rows.insert(chunk.id.clone(), chunk.clone());
        Ok(chunk)
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(table.rows.get(id).filter(|c| !c.is_deleted()).cloned())
    }

    async fn get_including_deleted(&self, id: &str) -> Result<Option<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(table.rows.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| table.rows.get(id))
            .filter(|c| !c.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(ordered(
            table
                .rows
                .values()
                .filter(|c| !c.is_deleted() && c.knowledge_id == knowledge_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_knowledge_base(
        &self,
        knowledge_base_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(ordered(
            table
                .rows
                .values()
                .filter(|c| !c.is_deleted() && c.knowledge_base_id == knowledge_base_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_knowledge_ids(&self, knowledge_base_id: &str) -> Result<Vec<String>, AppError> {
        let table = self.table.read().await;
        let ids: BTreeSet<String> = table
            .rows
            .values()
            .filter(|c| !c.is_deleted() && c.knowledge_base_id == knowledge_base_id)
            .map(|c| c.knowledge_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn list_children(&self, parent_chunk_id: &str) -> Result<Vec<Chunk>, AppError> {
        let mut children = self.list_children_including_deleted(parent_chunk_id).await?;
        children.retain(|c| !c.is_deleted());
        Ok(children)
    }

    async fn list_children_including_deleted(
        &self,
        parent_chunk_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(ordered(
            table
                .rows
                .values()
                .filter(|c| c.parent_chunk_id.as_deref() == Some(parent_chunk_id))
                .cloned()
                .collect(),
        ))
    }

    async fn list_referencing(&self, chunk_id: &str) -> Result<Vec<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(ordered(
            table
                .rows
                .values()
                .filter(|c| {
                    !c.is_deleted()
                        && (c.relation_chunks.iter().any(|id| id == chunk_id)
                            || c.indirect_relation_chunks.iter().any(|id| id == chunk_id))
                })
                .cloned()
                .collect(),
        ))
    }

    async fn find_by_content_hash(
        &self,
        knowledge_id: &str,
        content_hash: &str,
    ) -> Result<Option<Chunk>, AppError> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .filter(|c| {
                !c.is_deleted()
                    && c.knowledge_id == knowledge_id
                    && c.chunk_type == ChunkType::Faq
                    && c.content_hash.as_deref() == Some(content_hash)
            })
            .min_by_key(|c| c.seq_id)
            .cloned())
    }

    async fn soft_delete(&self, ids: &[String]) -> Result<usize, AppError> {
        let mut table = self.table.write().await;
        let now = Utc::now();
        let mut affected = 0usize;
        for id in ids {
            if let Some(row) = table.rows.get_mut(id) {
                if row.deleted_at.is_none() {
                    row.deleted_at = Some(now);
                    row.updated_at = now;
                    affected = affected.saturating_add(1);
                }
            }
        }
        Ok(affected)
    }

    async fn restore(&self, ids: &[String]) -> Result<usize, AppError> {
        let mut table = self.table.write().await;
        let mut affected = 0usize;
        for id in ids {
            if let Some(row) = table.rows.get_mut(id) {
                if row.deleted_at.take().is_some() {
                    affected = affected.saturating_add(1);
                }
            }
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_chunk(id: &str, knowledge_id: &str, index: usize) -> Chunk {
        let mut chunk = Chunk::new(
            id.into(),
            1,
            "kb-1",
            knowledge_id,
            ChunkType::Text,
            format!("content {index}"),
        );
        chunk.chunk_index = index;
        chunk
    }

    #[tokio::test]
    async fn upsert_assigns_increasing_seq_ids_and_keeps_them() {
        let store = InMemoryChunkStore::new();
        let a = store.upsert(text_chunk("a", "k1", 0)).await.expect("a");
        let b = store.upsert(text_chunk("b", "k1", 1)).await.expect("b");
        assert!(b.seq_id > a.seq_id);

        let mut replaced = text_chunk("a", "k1", 0);
        replaced.content = "updated".into();
        let replaced = store.upsert(replaced).await.expect("replace");
        assert_eq!(replaced.seq_id, a.seq_id);
        assert_eq!(replaced.created_at, a.created_at);
    }

    #[tokio::test]
    async fn explicit_seq_ids_must_be_unique() {
        let store = InMemoryChunkStore::new();
        let mut first = text_chunk("a", "k1", 0);
        first.seq_id = 42;
        store.upsert(first).await.expect("explicit seq");

        let mut clash = text_chunk("b", "k1", 1);
        clash.seq_id = 42;
        assert!(matches!(
            store.upsert(clash).await,
            Err(AppError::Validation(_))
        ));

        let next = store.upsert(text_chunk("c", "k1", 2)).await.expect("next");
        assert!(next.seq_id > 42);
    }

    #[tokio::test]
    async fn soft_deleted_rows_are_hidden_but_recoverable() {
        let store = InMemoryChunkStore::new();
        store.upsert(text_chunk("a", "k1", 1)).await.expect("a");
        store.upsert(text_chunk("b", "k1", 0)).await.expect("b");

        let listed = store.list_by_knowledge("k1").await.expect("list");
        assert_eq!(
            listed.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );

        assert_eq!(store.soft_delete(&["a".into()]).await.expect("delete"), 1);
        assert_eq!(store.soft_delete(&["a".into()]).await.expect("delete"), 0);
        assert!(store.get("a").await.expect("get").is_none());
        assert!(store
            .get_including_deleted("a")
            .await
            .expect("get deleted")
            .is_some());

        assert_eq!(store.restore(&["a".into()]).await.expect("restore"), 1);
        assert!(store.get("a").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn children_of_deleted_parents_stay_discoverable() {
        let store = InMemoryChunkStore::new();
        store.upsert(text_chunk("parent", "k1", 0)).await.expect("parent");
        let mut child = text_chunk("caption", "k1", 0);
        child.parent_chunk_id = Some("parent".into());
        store.upsert(child).await.expect("child");

        store
            .soft_delete(&["parent".into(), "caption".into()])
            .await
            .expect("delete");
        assert!(store.list_children("parent").await.expect("live").is_empty());
        let all = store
            .list_children_including_deleted("parent")
            .await
            .expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "caption");
    }
}
