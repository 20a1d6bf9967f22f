//! Chunk graph maintenance: ordering chains, parent/child image chunks,
//! relation links, deletion with neighbour repair, and knowledge-base cloning.

use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::{
        chunk_store::ChunkStore,
        types::chunk::{deterministic_id, Chunk, ChunkStatus, ChunkType},
    },
};
use tracing::{debug, info, warn};

use crate::reader::ParsedDocument;

/// The knowledge item chunks belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOwner {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub knowledge_id: String,
}

impl ChunkOwner {
    fn chunk(&self, id: String, chunk_type: ChunkType, content: String) -> Chunk {
        Chunk::new(
            id,
            self.tenant_id,
            &self.knowledge_base_id,
            &self.knowledge_id,
            chunk_type,
            content,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Ad-hoc removal of one chunk. Children are left alone.
    Single,
    /// Part of removing a whole document. Children go too.
    Document,
}

pub fn text_chunk_id(knowledge_id: &str, index: usize) -> String {
    deterministic_id(&[knowledge_id, "chunk", index.to_string().as_str()])
}

pub fn entity_chunk_id(knowledge_id: &str, name: &str) -> String {
    deterministic_id(&[knowledge_id, "entity", name.to_lowercase().as_str()])
}

pub fn relationship_chunk_id(knowledge_id: &str, from: &str, to: &str, kind: &str) -> String {
    deterministic_id(&[
        knowledge_id,
        "relationship",
        from.to_lowercase().as_str(),
        to.to_lowercase().as_str(),
        kind,
    ])
}

/// Knowledge id a source knowledge item gets inside a cloned knowledge base.
pub fn cloned_knowledge_id(target_kb: &str, source_knowledge_id: &str) -> String {
    deterministic_id(&[target_kb, "knowledge", source_knowledge_id])
}

pub fn cloned_chunk_id(target_kb: &str, source_chunk_id: &str) -> String {
    deterministic_id(&[target_kb, "chunk", source_chunk_id])
}

/// Point each chunk at its neighbours in slice order.
pub fn link_chain(chunks: &mut [Chunk]) {
    let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
    for (position, chunk) in chunks.iter_mut().enumerate() {
        chunk.pre_chunk_id = position
            .checked_sub(1)
            .and_then(|prev| ids.get(prev))
            .cloned();
        chunk.next_chunk_id = ids.get(position + 1).cloned();
    }
}

/// Turn a parsed document into text chunks plus, when multimodal is on,
/// OCR and caption children for every image.
pub fn build_document_chunks(
    owner: &ChunkOwner,
    document: &ParsedDocument,
    multimodal: bool,
) -> Vec<Chunk> {
    let mut text_chunks: Vec<Chunk> = document
        .chunks
        .iter()
        .map(|parsed| {
            let mut chunk = owner.chunk(
                text_chunk_id(&owner.knowledge_id, parsed.seq),
                ChunkType::Text,
                parsed.content.clone(),
            );
            chunk.chunk_index = parsed.seq;
            chunk.start_at = parsed.start;
            chunk.end_at = parsed.end;
            if multimodal {
                chunk.image_info.clone_from(&parsed.images);
            }
            chunk
        })
        .collect();
    link_chain(&mut text_chunks);

    let mut children = Vec::new();
    if multimodal {
        for parent in &text_chunks {
            for image in &parent.image_info {
                let position = image.start_pos.to_string();
                let variants = [
                    (ChunkType::ImageOcr, image.ocr_text.trim()),
                    (ChunkType::ImageCaption, image.caption.trim()),
                ];
                for (chunk_type, content) in variants {
                    if content.is_empty() {
                        continue;
                    }
                    let mut child = owner.chunk(
                        deterministic_id(&[
                            parent.id.as_str(),
                            chunk_type.as_str(),
                            image.url.as_str(),
                            position.as_str(),
                        ]),
                        chunk_type,
                        content.to_string(),
                    );
                    child.chunk_index = parent.chunk_index;
                    child.start_at = parent.start_at;
                    child.end_at = parent.end_at;
                    child.parent_chunk_id = Some(parent.id.clone());
                    child.image_info = vec![image.clone()];
                    children.push(child);
                }
            }
        }
    }

    text_chunks.extend(children);
    text_chunks
}

/// Persist a freshly built chunk set for a knowledge item and drop content
/// chunks from earlier runs that the new set no longer contains.
///
/// Returns the stored chunks and the ids of the chunks that were removed.
pub async fn replace_document_chunks(
    store: &dyn ChunkStore,
    knowledge_id: &str,
    chunks: Vec<Chunk>,
) -> Result<(Vec<Chunk>, Vec<String>), AppError> {
    let fresh: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    let stale: Vec<String> = store
        .list_by_knowledge(knowledge_id)
        .await?
        .into_iter()
        .filter(|c| {
            matches!(
                c.chunk_type,
                ChunkType::Text | ChunkType::ImageOcr | ChunkType::ImageCaption
            ) && !fresh.contains(c.id.as_str())
        })
        .map(|c| c.id)
        .collect();

    if !stale.is_empty() {
        debug!(knowledge_id, count = stale.len(), "dropping chunks from earlier run");
        store.soft_delete(&stale).await?;
    }

    let prepared = chunks
        .into_iter()
        .map(|mut chunk| {
            chunk.reset_status();
            chunk.advance_status(ChunkStatus::Stored);
            chunk
        })
        .collect();
    let stored = store.upsert_many(prepared).await?;
    Ok((stored, stale))
}

/// Append ids not yet present, keeping first-occurrence order.
pub fn merge_relations(existing: &mut Vec<String>, additions: &[String]) {
    for id in additions {
        if !existing.iter().any(|known| known == id) {
            existing.push(id.clone());
        }
    }
}

/// Record direct and transitive relations on a source chunk.
pub async fn link_relations(
    store: &dyn ChunkStore,
    source_chunk_id: &str,
    direct: &[String],
    indirect: &[String],
) -> Result<Chunk, AppError> {
    let mut source = store
        .get(source_chunk_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("chunk {source_chunk_id}")))?;

    let direct: Vec<String> = direct
        .iter()
        .filter(|id| id.as_str() != source_chunk_id)
        .cloned()
        .collect();
    let indirect: Vec<String> = indirect
        .iter()
        .filter(|id| id.as_str() != source_chunk_id && !direct.contains(id))
        .cloned()
        .collect();

    merge_relations(&mut source.relation_chunks, &direct);
    merge_relations(&mut source.indirect_relation_chunks, &indirect);
    store.upsert(source).await
}

/// Live neighbours of a chunk. Links to deleted or missing chunks resolve to `None`.
pub async fn resolve_neighbors(
    store: &dyn ChunkStore,
    chunk: &Chunk,
) -> Result<(Option<Chunk>, Option<Chunk>), AppError> {
    let prev = match &chunk.pre_chunk_id {
        Some(id) => store.get(id).await?,
        None => None,
    };
    let next = match &chunk.next_chunk_id {
        Some(id) => store.get(id).await?,
        None => None,
    };
    Ok((prev, next))
}

/// Bridge the chain around `chunk` and persist both neighbours. Returns the
/// neighbours as they were, for `restore_links`.
async fn repair_chain(store: &dyn ChunkStore, chunk: &Chunk) -> Result<Vec<Chunk>, AppError> {
    let (prev, next) = resolve_neighbors(store, chunk).await?;
    let prev_id = prev.as_ref().map(|c| c.id.clone());
    let next_id = next.as_ref().map(|c| c.id.clone());
    let originals: Vec<Chunk> = prev.iter().chain(next.iter()).cloned().collect();

    if let Some(mut prev) = prev {
        prev.next_chunk_id.clone_from(&next_id);
        store.upsert(prev).await?;
    }
    if let Some(mut next) = next {
        next.pre_chunk_id = prev_id;
        if let Err(err) = store.upsert(next).await {
            restore_links(store, originals).await;
            return Err(err);
        }
    }
    Ok(originals)
}

/// Put neighbours back as they were before a delete that did not go through.
async fn restore_links(store: &dyn ChunkStore, originals: Vec<Chunk>) {
    for chunk in originals {
        let id = chunk.id.clone();
        if let Err(err) = store.upsert(chunk).await {
            warn!(chunk_id = %id, error = %err, "could not restore chain link");
        }
    }
}

/// Remove every reference to `removed` from relation sets of live chunks.
async fn strip_references(store: &dyn ChunkStore, removed: &HashSet<String>) -> Result<(), AppError> {
    let mut touched: HashMap<String, Chunk> = HashMap::new();
    for id in removed {
        for chunk in store.list_referencing(id).await? {
            if removed.contains(&chunk.id) {
                continue;
            }
            touched.entry(chunk.id.clone()).or_insert(chunk);
        }
    }

    for (_, mut chunk) in touched {
        chunk.relation_chunks.retain(|id| !removed.contains(id));
        chunk
            .indirect_relation_chunks
            .retain(|id| !removed.contains(id));
        store.upsert(chunk).await?;
    }
    Ok(())
}

async fn collect_descendants(
    store: &dyn ChunkStore,
    root: &str,
    into: &mut Vec<String>,
) -> Result<(), AppError> {
    let mut pending = vec![root.to_string()];
    while let Some(parent) = pending.pop() {
        for child in store.list_children(&parent).await? {
            if !into.contains(&child.id) {
                into.push(child.id.clone());
                pending.push(child.id);
            }
        }
    }
    Ok(())
}

/// Every descendant of `roots`, tombstoned or not. A delete that is retried
/// after its parents are gone still reaches their children this way.
pub async fn cascaded_ids(store: &dyn ChunkStore, roots: &[String]) -> Result<Vec<String>, AppError> {
    let mut ids = Vec::new();
    let mut pending: Vec<String> = roots.to_vec();
    while let Some(parent) = pending.pop() {
        for child in store.list_children_including_deleted(&parent).await? {
            if !roots.contains(&child.id) && !ids.contains(&child.id) {
                ids.push(child.id.clone());
                pending.push(child.id);
            }
        }
    }
    Ok(ids)
}

/// Soft-delete one chunk after repairing its neighbours and stripping it from
/// relation sets. Returns the ids that were deleted.
pub async fn delete_chunk(
    store: &dyn ChunkStore,
    chunk_id: &str,
    scope: DeleteScope,
) -> Result<Vec<String>, AppError> {
    let chunk = store
        .get(chunk_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("chunk {chunk_id}")))?;

    let originals = repair_chain(store, &chunk).await?;

    let mut ids = vec![chunk.id.clone()];
    let removed = async {
        if scope == DeleteScope::Document {
            collect_descendants(store, &chunk.id, &mut ids).await?;
        }
        let removed: HashSet<String> = ids.iter().cloned().collect();
        strip_references(store, &removed).await?;
        store.soft_delete(&ids).await
    }
    .await;
    if let Err(err) = removed {
        // The chunk is still live, so the chain must keep pointing at it.
        restore_links(store, originals).await;
        return Err(err);
    }

    debug!(chunk_id, deleted = ids.len(), ?scope, "chunk deleted");
    Ok(ids)
}

/// Soft-delete many chunks, one at a time so every chain repair sees the
/// previous one. Ids that are already gone are skipped.
pub async fn delete_chunks(
    store: &dyn ChunkStore,
    chunk_ids: &[String],
    scope: DeleteScope,
) -> Result<Vec<String>, AppError> {
    let mut deleted = Vec::new();
    for id in chunk_ids {
        match delete_chunk(store, id, scope).await {
            Ok(ids) => merge_relations(&mut deleted, &ids),
            Err(AppError::NotFound(_)) => debug!(chunk_id = %id, "chunk already deleted"),
            Err(err) => return Err(err),
        }
    }
    Ok(deleted)
}

/// Soft-delete every chunk of a knowledge item. Returns the deleted ids.
pub async fn delete_by_knowledge(
    store: &dyn ChunkStore,
    knowledge_id: &str,
) -> Result<Vec<String>, AppError> {
    let ids: Vec<String> = store
        .list_by_knowledge(knowledge_id)
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();
    if ids.is_empty() {
        return Ok(ids);
    }

    let removed: HashSet<String> = ids.iter().cloned().collect();
    strip_references(store, &removed).await?;
    store.soft_delete(&ids).await?;
    info!(knowledge_id, deleted = ids.len(), "knowledge chunks deleted");
    Ok(ids)
}

/// Toggle retrieval visibility of a single chunk. Children are not touched.
pub async fn set_enabled(
    store: &dyn ChunkStore,
    chunk_id: &str,
    enabled: bool,
) -> Result<Chunk, AppError> {
    let mut chunk = store
        .get(chunk_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("chunk {chunk_id}")))?;
    chunk.is_enabled = enabled;
    store.upsert(chunk).await
}

/// Copies of `chunks` placed in `target_kb`, with every id and internal link
/// remapped. Links that point outside the copied set are dropped.
pub fn remap_for_clone(chunks: &[Chunk], target_kb: &str) -> Vec<Chunk> {
    let mapping: HashMap<&str, String> = chunks
        .iter()
        .map(|c| (c.id.as_str(), cloned_chunk_id(target_kb, &c.id)))
        .collect();
    let remap = |id: &Option<String>| {
        id.as_deref()
            .and_then(|id| mapping.get(id))
            .cloned()
    };
    let remap_all = |ids: &[String]| -> Vec<String> {
        ids.iter()
            .filter_map(|id| mapping.get(id.as_str()))
            .cloned()
            .collect()
    };

    chunks
        .iter()
        .map(|source| {
            let mut copy = source.clone();
            copy.id = cloned_chunk_id(target_kb, &source.id);
            copy.seq_id = 0;
            copy.knowledge_base_id = target_kb.to_string();
            copy.knowledge_id = cloned_knowledge_id(target_kb, &source.knowledge_id);
            copy.pre_chunk_id = remap(&source.pre_chunk_id);
            copy.next_chunk_id = remap(&source.next_chunk_id);
            copy.parent_chunk_id = remap(&source.parent_chunk_id);
            copy.relation_chunks = remap_all(&source.relation_chunks);
            copy.indirect_relation_chunks = remap_all(&source.indirect_relation_chunks);
            copy.reset_status();
            copy.advance_status(ChunkStatus::Stored);
            copy
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{parse_text, ParsedChunk, ReadConfig};
    use common::storage::{chunk_store::InMemoryChunkStore, types::chunk::ImageInfo};

    fn owner() -> ChunkOwner {
        ChunkOwner {
            tenant_id: 1,
            knowledge_base_id: "kb-1".into(),
            knowledge_id: "k-1".into(),
        }
    }

    fn three_chunk_document() -> ParsedDocument {
        let config = ReadConfig {
            chunk_size: 12,
            chunk_overlap: 0,
            separators: vec!["\n".into()],
            enable_multimodal: false,
        };
        parse_text("doc".into(), "alpha line\nbeta line\ngamma line\n", &config).expect("parse")
    }

    async fn stored_chain(store: &InMemoryChunkStore) -> Vec<Chunk> {
        let chunks = build_document_chunks(&owner(), &three_chunk_document(), false);
        assert_eq!(chunks.len(), 3);
        replace_document_chunks(store, "k-1", chunks)
            .await
            .expect("store")
            .0
    }

    #[tokio::test]
    async fn deleting_middle_chunk_bridges_neighbours() {
        let store = InMemoryChunkStore::new();
        let chain = stored_chain(&store).await;
        let (a, b, c) = (&chain[0], &chain[1], &chain[2]);

        delete_chunk(&store, &b.id, DeleteScope::Single)
            .await
            .expect("delete");

        let a = store.get(&a.id).await.expect("get").expect("a");
        let c = store.get(&c.id).await.expect("get").expect("c");
        assert_eq!(a.next_chunk_id.as_deref(), Some(c.id.as_str()));
        assert_eq!(c.pre_chunk_id.as_deref(), Some(a.id.as_str()));
        assert!(store.get(&b.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn deleting_head_or_tail_empties_one_side() {
        let store = InMemoryChunkStore::new();
        let chain = stored_chain(&store).await;

        delete_chunk(&store, &chain[0].id, DeleteScope::Single)
            .await
            .expect("delete head");
        let b = store.get(&chain[1].id).await.expect("get").expect("b");
        assert!(b.pre_chunk_id.is_none());

        delete_chunk(&store, &chain[2].id, DeleteScope::Single)
            .await
            .expect("delete tail");
        let b = store.get(&chain[1].id).await.expect("get").expect("b");
        assert!(b.next_chunk_id.is_none());
    }

    #[tokio::test]
    async fn redelivery_does_not_duplicate_chain() {
        let store = InMemoryChunkStore::new();
        let first = stored_chain(&store).await;
        let second = stored_chain(&store).await;

        let live = store.list_by_knowledge("k-1").await.expect("list");
        assert_eq!(live.len(), 3);
        assert_eq!(
            first.iter().map(|c| &c.id).collect::<Vec<_>>(),
            second.iter().map(|c| &c.id).collect::<Vec<_>>()
        );
        assert_eq!(first[1].seq_id, second[1].seq_id);
    }

    #[tokio::test]
    async fn reprocessing_with_fewer_chunks_drops_the_rest() {
        let store = InMemoryChunkStore::new();
        stored_chain(&store).await;

        let shorter = ParsedDocument {
            title: "doc".into(),
            chunks: vec![ParsedChunk {
                content: "alpha line".into(),
                seq: 0,
                start: 0,
                end: 10,
                images: Vec::new(),
            }],
        };
        let (_, removed) = replace_document_chunks(
            &store,
            "k-1",
            build_document_chunks(&owner(), &shorter, false),
        )
        .await
        .expect("replace");
        assert_eq!(removed.len(), 2);
        let live = store.list_by_knowledge("k-1").await.expect("list");
        assert_eq!(live.len(), 1);
        assert!(live[0].next_chunk_id.is_none());
    }

    #[tokio::test]
    async fn image_children_cascade_only_for_document_scope() {
        let store = InMemoryChunkStore::new();
        let document = ParsedDocument {
            title: "doc".into(),
            chunks: vec![ParsedChunk {
                content: "See ![chart](c.png)".into(),
                seq: 0,
                start: 0,
                end: 19,
                images: vec![ImageInfo {
                    url: "c.png".into(),
                    original_url: "c.png".into(),
                    start_pos: 4,
                    end_pos: 19,
                    caption: "chart".into(),
                    ocr_text: "Q3 revenue".into(),
                }],
            }],
        };
        let chunks = build_document_chunks(&owner(), &document, true);
        assert_eq!(chunks.len(), 3);
        let parent_id = chunks[0].id.clone();
        assert!(chunks[1..]
            .iter()
            .all(|c| c.parent_chunk_id.as_deref() == Some(parent_id.as_str())));
        replace_document_chunks(&store, "k-1", chunks)
            .await
            .expect("store");

        set_enabled(&store, &parent_id, false).await.expect("disable");
        assert_eq!(store.list_children(&parent_id).await.expect("children").len(), 2);

        delete_chunk(&store, &parent_id, DeleteScope::Single)
            .await
            .expect("single delete");
        assert_eq!(store.list_children(&parent_id).await.expect("children").len(), 2);

        store.restore(&[parent_id.clone()]).await.expect("restore");
        let deleted = delete_chunk(&store, &parent_id, DeleteScope::Document)
            .await
            .expect("document delete");
        assert_eq!(deleted.len(), 3);
        assert!(store.list_children(&parent_id).await.expect("children").is_empty());
    }

    #[tokio::test]
    async fn relations_merge_in_order_and_are_stripped_on_delete() {
        let store = InMemoryChunkStore::new();
        let chain = stored_chain(&store).await;
        let source = &chain[0].id;
        let (r1, r2) = (chain[1].id.clone(), chain[2].id.clone());

        link_relations(&store, source, &[r1.clone()], &[r2.clone()])
            .await
            .expect("link");
        let updated = link_relations(&store, source, &[r2.clone(), r1.clone()], &[r2.clone()])
            .await
            .expect("link again");
        assert_eq!(updated.relation_chunks, vec![r1.clone(), r2.clone()]);
        assert_eq!(updated.indirect_relation_chunks, vec![r2.clone()]);

        delete_chunk(&store, &r2, DeleteScope::Single)
            .await
            .expect("delete");
        let source = store.get(source).await.expect("get").expect("source");
        assert_eq!(source.relation_chunks, vec![r1]);
        assert!(source.indirect_relation_chunks.is_empty());
    }

    #[test]
    fn clone_remaps_internal_links_and_drops_external_ones() {
        let mut chunks = build_document_chunks(&owner(), &three_chunk_document(), false);
        chunks[0].relation_chunks = vec![chunks[2].id.clone(), "outside".into()];
        let copies = remap_for_clone(&chunks, "kb-2");

        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|c| c.knowledge_base_id == "kb-2"));
        assert_eq!(copies[0].next_chunk_id.as_deref(), Some(copies[1].id.as_str()));
        assert_eq!(copies[2].pre_chunk_id.as_deref(), Some(copies[1].id.as_str()));
        assert_eq!(copies[0].relation_chunks, vec![copies[2].id.clone()]);
        assert_eq!(copies[0].knowledge_id, cloned_knowledge_id("kb-2", "k-1"));
        assert_ne!(copies[0].id, chunks[0].id);
        assert_eq!(remap_for_clone(&chunks, "kb-2")[0].id, copies[0].id);
    }

    /// Memory store whose soft deletes always fail.
    #[derive(Default)]
    struct RejectingDeletes {
        inner: InMemoryChunkStore,
    }

    #[async_trait::async_trait]
    impl ChunkStore for RejectingDeletes {
        async fn upsert(&self, chunk: Chunk) -> Result<Chunk, AppError> {
            self.inner.upsert(chunk).await
        }

        async fn get(&self, id: &str) -> Result<Option<Chunk>, AppError> {
            self.inner.get(id).await
        }

        async fn get_including_deleted(&self, id: &str) -> Result<Option<Chunk>, AppError> {
            self.inner.get_including_deleted(id).await
        }

        async fn get_many(&self, ids: &[String]) -> Result<Vec<Chunk>, AppError> {
            self.inner.get_many(ids).await
        }

        async fn list_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<Chunk>, AppError> {
            self.inner.list_by_knowledge(knowledge_id).await
        }

        async fn list_by_knowledge_base(&self, knowledge_base_id: &str) -> Result<Vec<Chunk>, AppError> {
            self.inner.list_by_knowledge_base(knowledge_base_id).await
        }

        async fn list_knowledge_ids(&self, knowledge_base_id: &str) -> Result<Vec<String>, AppError> {
            self.inner.list_knowledge_ids(knowledge_base_id).await
        }

        async fn list_children(&self, parent_chunk_id: &str) -> Result<Vec<Chunk>, AppError> {
            self.inner.list_children(parent_chunk_id).await
        }

        async fn list_children_including_deleted(
            &self,
            parent_chunk_id: &str,
        ) -> Result<Vec<Chunk>, AppError> {
            self.inner.list_children_including_deleted(parent_chunk_id).await
        }

        async fn list_referencing(&self, chunk_id: &str) -> Result<Vec<Chunk>, AppError> {
            self.inner.list_referencing(chunk_id).await
        }

        async fn find_by_content_hash(
            &self,
            knowledge_id: &str,
            content_hash: &str,
        ) -> Result<Option<Chunk>, AppError> {
            self.inner.find_by_content_hash(knowledge_id, content_hash).await
        }

        async fn soft_delete(&self, _ids: &[String]) -> Result<usize, AppError> {
            Err(AppError::StoreUnavailable("chunk store read-only".into()))
        }

        async fn restore(&self, ids: &[String]) -> Result<usize, AppError> {
            self.inner.restore(ids).await
        }
    }

    #[tokio::test]
    async fn failed_delete_leaves_the_chain_intact() {
        let store = RejectingDeletes::default();
        let chunks = build_document_chunks(&owner(), &three_chunk_document(), false);
        let chain = store.upsert_many(chunks).await.expect("store");
        let (a, b, c) = (&chain[0], &chain[1], &chain[2]);

        let err = delete_chunk(&store, &b.id, DeleteScope::Single)
            .await
            .expect_err("delete rejected");
        assert!(matches!(err, AppError::StoreUnavailable(_)));

        assert!(store.get(&b.id).await.expect("get").is_some());
        let a = store.get(&a.id).await.expect("get").expect("a");
        let c = store.get(&c.id).await.expect("get").expect("c");
        assert_eq!(a.next_chunk_id.as_deref(), Some(b.id.as_str()));
        assert_eq!(c.pre_chunk_id.as_deref(), Some(b.id.as_str()));
    }

    #[tokio::test]
    async fn cascaded_ids_reach_children_of_tombstoned_parents() {
        let store = InMemoryChunkStore::new();
        let chain = stored_chain(&store).await;
        let parent = &chain[0];
        let mut caption = parent.clone();
        caption.id = "caption-of-first".into();
        caption.seq_id = 0;
        caption.chunk_type = ChunkType::ImageCaption;
        caption.parent_chunk_id = Some(parent.id.clone());
        caption.pre_chunk_id = None;
        caption.next_chunk_id = None;
        store.upsert(caption).await.expect("caption");

        delete_chunk(&store, &parent.id, DeleteScope::Document)
            .await
            .expect("delete");
        assert_eq!(
            cascaded_ids(&store, &[parent.id.clone()]).await.expect("cascade"),
            vec!["caption-of-first".to_string()]
        );
    }
}
