use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        chunk_store::{ChunkStore, InMemoryChunkStore},
        kv::{EphemeralStore, MemoryKvStore, RedisKvStore},
        queue::{MemoryTaskQueue, RedisTaskQueue, TaskQueue},
        store::StorageManager,
        types::{
            chunk::{Chunk, ChunkStatus},
            engine::{EffectiveEngine, EngineReport},
            task::{TaskEnvelope, TaskPayload},
        },
    },
    utils::{
        chat::ChatModel,
        config::AppConfig,
        embedding::EmbeddingProvider,
        providers::{ProviderConfig, ProviderRegistry},
    },
};
use tracing::{debug, info, warn};

use crate::{
    cancellation::CancellationRegistry,
    engines::{into_result, EngineRegistry, IndexEntry},
    progress::ProgressStore,
    reader::{DocumentReader, LocalDocumentReader},
};

const INDEX_BATCH_SIZE: usize = 64;

/// Everything a task handler reaches for.
pub struct IngestionServices {
    pub config: AppConfig,
    pub chunks: Arc<dyn ChunkStore>,
    pub progress: ProgressStore,
    pub queue: Arc<dyn TaskQueue>,
    pub storage: StorageManager,
    pub engines: EngineRegistry,
    pub embedder: Arc<EmbeddingProvider>,
    pub chat: Arc<dyn ChatModel>,
    pub reader: Arc<dyn DocumentReader>,
    pub cancellations: CancellationRegistry,
}

/// The externally backed pieces; the rest is derived from config.
pub struct ServiceBackends {
    pub kv: Arc<dyn EphemeralStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub chunks: Arc<dyn ChunkStore>,
    pub storage: StorageManager,
    pub embedder: Arc<EmbeddingProvider>,
    pub chat: Arc<dyn ChatModel>,
}

impl IngestionServices {
    pub fn new(config: AppConfig, backends: ServiceBackends) -> Result<Self, AppError> {
        let progress = ProgressStore::new(
            backends.kv,
            config.key_prefix.clone(),
            Duration::from_secs(config.progress_ttl_secs),
        );
        let engines = EngineRegistry::from_config(&config)?;
        let reader = Arc::new(LocalDocumentReader::new(config.url_fetch_allow_private));

        Ok(Self {
            chunks: backends.chunks,
            progress,
            queue: backends.queue,
            storage: backends.storage,
            engines,
            embedder: backends.embedder,
            chat: backends.chat,
            reader,
            cancellations: CancellationRegistry::new(),
            config,
        })
    }

    /// Fully in-process wiring: memory KV, queue, chunk store and object storage.
    pub fn in_memory(config: AppConfig, chat: Arc<dyn ChatModel>) -> Result<Self, AppError> {
        let embedder = Arc::new(EmbeddingProvider::new_hashed(
            config.embedding_dimensions as usize,
        ));
        Self::new(
            config,
            ServiceBackends {
                kv: Arc::new(MemoryKvStore::new()),
                queue: Arc::new(MemoryTaskQueue::new()),
                chunks: Arc::new(InMemoryChunkStore::new()),
                storage: StorageManager::in_memory(),
                embedder,
                chat,
            },
        )
    }

    /// Wiring for a deployed worker. Redis backs progress and the queue when
    /// `redis_url` is set; otherwise both stay in process memory.
    pub async fn connect(config: AppConfig) -> Result<Self, AppError> {
        let client = Arc::new(async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        ));
        let chat = ProviderRegistry::with_builtin().build_chat(&ProviderConfig {
            provider: config.chat_provider.clone(),
            base_url: config.openai_base_url.clone(),
            api_key: config.openai_api_key.clone(),
            model_name: config.chat_model.clone(),
        })?;
        let embedder = Arc::new(EmbeddingProvider::from_config(&config, client)?);
        let storage = StorageManager::new(&config).await?;

        let (kv, queue): (Arc<dyn EphemeralStore>, Arc<dyn TaskQueue>) = match &config.redis_url {
            Some(redis_url) => (
                Arc::new(RedisKvStore::connect(redis_url).await?),
                Arc::new(RedisTaskQueue::connect(redis_url, &config.key_prefix).await?),
            ),
            None => {
                warn!("redis_url not set, progress and queue live in process memory");
                (Arc::new(MemoryKvStore::new()), Arc::new(MemoryTaskQueue::new()))
            }
        };
        info!(
            storage = ?config.storage,
            chat_provider = %config.chat_provider,
            embedding = embedder.backend_label(),
            engines = config.retrieval_engines.len(),
            "ingestion services connected"
        );

        Self::new(
            config,
            ServiceBackends {
                kv,
                queue,
                chunks: Arc::new(InMemoryChunkStore::new()),
                storage,
                embedder,
                chat,
            },
        )
    }

    #[must_use]
    pub fn with_engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = engines;
        self
    }

    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn DocumentReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.running_lock_ttl_secs)
    }

    /// Wrap a payload in an envelope and push it. Returns the envelope id.
    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<String, AppError> {
        let envelope = TaskEnvelope::new(payload, self.config.task_max_attempts)?;
        let id = envelope.id.clone();
        self.queue.push(envelope).await?;
        debug!(task_id = %id, task_type = %payload.task_type(), "task enqueued");
        Ok(id)
    }

    /// Searchable entries for a chunk: its content plus every generated question.
    async fn entries_for(&self, chunk: &Chunk) -> Result<Vec<IndexEntry>, AppError> {
        let mut texts = vec![(chunk.id.clone(), chunk.content.clone())];
        if let Some(meta) = chunk.document_metadata() {
            texts.extend(
                meta.generated_questions
                    .iter()
                    .map(|q| (q.id.clone(), q.question.clone())),
            );
        }

        let embeddings = self
            .embedder
            .embed_batch(texts.iter().map(|(_, text)| text.clone()).collect())
            .await?;

        Ok(texts
            .into_iter()
            .zip(embeddings)
            .map(|((source_id, content), embedding)| IndexEntry {
                source_id,
                chunk_id: chunk.id.clone(),
                knowledge_id: chunk.knowledge_id.clone(),
                knowledge_base_id: chunk.knowledge_base_id.clone(),
                content,
                embedding,
                is_enabled: chunk.is_enabled,
            })
            .collect())
    }

    /// Embed and index chunks into the default engines, then mark them indexed.
    ///
    /// Fails with `PartialEngineFailure` when any engine rejects the batch; the
    /// chunks keep their previous status in that case.
    pub async fn index_chunks(&self, chunks: Vec<Chunk>) -> Result<(Vec<Chunk>, EngineReport), AppError> {
        let engines = self.engines.defaults().to_vec();
        self.index_chunks_into(&engines, chunks).await
    }

    pub async fn index_chunks_into(
        &self,
        engines: &[EffectiveEngine],
        chunks: Vec<Chunk>,
    ) -> Result<(Vec<Chunk>, EngineReport), AppError> {
        if chunks.is_empty() {
            return Ok((chunks, EngineReport::default()));
        }

        let mut report = EngineReport::default();
        for batch in chunks.chunks(INDEX_BATCH_SIZE) {
            let mut entries = Vec::new();
            for chunk in batch {
                entries.extend(self.entries_for(chunk).await?);
            }
            report.merge(self.engines.index(engines, &entries).await);
        }
        let report = into_result(report)?;

        let indexed = chunks
            .into_iter()
            .map(|mut chunk| {
                chunk.advance_status(ChunkStatus::Indexed);
                chunk
            })
            .collect();
        let stored = self.chunks.upsert_many(indexed).await?;
        info!(
            chunks = stored.len(),
            engines = engines.len(),
            "chunks indexed"
        );
        Ok((stored, report))
    }
}
