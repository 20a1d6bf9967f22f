use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::deterministic_id,
        engine::{EffectiveEngine, EngineFailure, EngineReport},
    },
    utils::config::AppConfig,
};
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, warn};

/// One searchable document inside a retrieval engine.
///
/// `source_id` is the entry key: the chunk id for chunk content, or a derived
/// id for generated questions that point back at `chunk_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub source_id: String,
    pub chunk_id: String,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub is_enabled: bool,
}

/// Where a copied chunk lands during a knowledge-base clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCopy {
    pub source_chunk_id: String,
    pub target_chunk_id: String,
    pub target_knowledge_id: String,
}

#[async_trait]
pub trait RetrievalEngine: Send + Sync {
    fn engine(&self) -> &EffectiveEngine;

    async fn index(&self, entries: Vec<IndexEntry>) -> Result<usize, AppError>;

    async fn delete_by_chunk_ids(&self, chunk_ids: &[String]) -> Result<usize, AppError>;

    async fn delete_by_knowledge_base(&self, knowledge_base_id: &str) -> Result<usize, AppError>;

    async fn delete_by_knowledge_ids(&self, knowledge_ids: &[String]) -> Result<usize, AppError>;

    async fn copy_indices(
        &self,
        target_knowledge_base_id: &str,
        copies: &[IndexCopy],
    ) -> Result<usize, AppError>;
}

/// Process-local engine. Failures can be switched on to exercise partial outcomes.
pub struct InMemoryEngine {
    engine: EffectiveEngine,
    entries: RwLock<HashMap<String, IndexEntry>>,
    failing: AtomicBool,
}

impl InMemoryEngine {
    pub fn new(engine: EffectiveEngine) -> Self {
        Self {
            engine,
            entries: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable(format!(
                "{} is unreachable",
                self.engine
            )));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn entries_for_chunk(&self, chunk_id: &str) -> Vec<IndexEntry> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.chunk_id == chunk_id)
            .cloned()
            .collect()
    }

    async fn remove_where(&self, predicate: impl Fn(&IndexEntry) -> bool + Send) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !predicate(entry));
        before - entries.len()
    }
}

#[async_trait]
impl RetrievalEngine for InMemoryEngine {
    fn engine(&self) -> &EffectiveEngine {
        &self.engine
    }

    async fn index(&self, entries: Vec<IndexEntry>) -> Result<usize, AppError> {
        self.check_available()?;
        let count = entries.len();
        let mut stored = self.entries.write().await;
        for entry in entries {
            stored.insert(entry.source_id.clone(), entry);
        }
        Ok(count)
    }

    async fn delete_by_chunk_ids(&self, chunk_ids: &[String]) -> Result<usize, AppError> {
        self.check_available()?;
        Ok(self
            .remove_where(|entry| chunk_ids.contains(&entry.chunk_id))
            .await)
    }

    async fn delete_by_knowledge_base(&self, knowledge_base_id: &str) -> Result<usize, AppError> {
        self.check_available()?;
        Ok(self
            .remove_where(|entry| entry.knowledge_base_id == knowledge_base_id)
            .await)
    }

    async fn delete_by_knowledge_ids(&self, knowledge_ids: &[String]) -> Result<usize, AppError> {
        self.check_available()?;
        Ok(self
            .remove_where(|entry| knowledge_ids.contains(&entry.knowledge_id))
            .await)
    }

    async fn copy_indices(
        &self,
        target_knowledge_base_id: &str,
        copies: &[IndexCopy],
    ) -> Result<usize, AppError> {
        self.check_available()?;
        let by_source: HashMap<&str, &IndexCopy> = copies
            .iter()
            .map(|copy| (copy.source_chunk_id.as_str(), copy))
            .collect();

        let mut entries = self.entries.write().await;
        let copied: Vec<IndexEntry> = entries
            .values()
            .filter_map(|entry| {
                let copy = by_source.get(entry.chunk_id.as_str())?;
                let source_id = if entry.source_id == entry.chunk_id {
                    copy.target_chunk_id.clone()
                } else {
                    deterministic_id(&[copy.target_chunk_id.as_str(), entry.source_id.as_str()])
                };
                Some(IndexEntry {
                    source_id,
                    chunk_id: copy.target_chunk_id.clone(),
                    knowledge_id: copy.target_knowledge_id.clone(),
                    knowledge_base_id: target_knowledge_base_id.to_string(),
                    content: entry.content.clone(),
                    embedding: entry.embedding.clone(),
                    is_enabled: entry.is_enabled,
                })
            })
            .collect();

        let count = copied.len();
        for entry in copied {
            entries.insert(entry.source_id.clone(), entry);
        }
        Ok(count)
    }
}

/// Resolves engine descriptors to live handles and fans operations out to them.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<EffectiveEngine, Arc<dyn RetrievalEngine>>,
    defaults: Vec<EffectiveEngine>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One in-process engine per configured `engine:retriever` entry, all default.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let mut registry = Self::new();
        for descriptor in &config.retrieval_engines {
            let engine: EffectiveEngine = descriptor.parse()?;
            registry.register(Arc::new(InMemoryEngine::new(engine)), true);
        }
        Ok(registry)
    }

    pub fn register(&mut self, engine: Arc<dyn RetrievalEngine>, is_default: bool) {
        let descriptor = engine.engine().clone();
        if is_default && !self.defaults.contains(&descriptor) {
            self.defaults.push(descriptor.clone());
        }
        self.engines.insert(descriptor, engine);
    }

    pub fn get(&self, engine: &EffectiveEngine) -> Option<Arc<dyn RetrievalEngine>> {
        self.engines.get(engine).cloned()
    }

    /// Engines used when a task does not name its own.
    pub fn defaults(&self) -> &[EffectiveEngine] {
        &self.defaults
    }

    /// Run `op` against every engine concurrently and collect the outcome
    /// per engine. A failing or unknown engine never stops the others.
    async fn fan_out<F, Fut>(&self, engines: &[EffectiveEngine], operation: &str, op: F) -> EngineReport
    where
        F: Fn(Arc<dyn RetrievalEngine>) -> Fut,
        Fut: Future<Output = Result<usize, AppError>>,
    {
        let outcomes = join_all(engines.iter().map(|engine| {
            let pending = self.get(engine).map(&op);
            async move {
                let outcome = match pending {
                    Some(fut) => fut.await,
                    None => Err(AppError::NotFound(format!(
                        "no retrieval engine registered for {engine}"
                    ))),
                };
                (engine.clone(), outcome)
            }
        }))
        .await;

        let mut report = EngineReport::default();
        for (engine, outcome) in outcomes {
            match outcome {
                Ok(affected) => {
                    debug!(engine = %engine, operation, affected, "engine operation succeeded");
                    report.succeeded.push(engine);
                }
                Err(err) => {
                    warn!(engine = %engine, operation, error = %err, "engine operation failed");
                    report.failed.push(EngineFailure {
                        engine,
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Index entries with per-engine retry and backoff.
    pub async fn index(&self, engines: &[EffectiveEngine], entries: &[IndexEntry]) -> EngineReport {
        self.fan_out(engines, "index", |engine| async move {
            let strategy = ExponentialBackoff::from_millis(2)
                .factor(25)
                .max_delay(Duration::from_millis(800))
                .map(jitter)
                .take(3);
            Retry::spawn(strategy, || engine.index(entries.to_vec())).await
        })
        .await
    }

    pub async fn delete_by_chunk_ids(
        &self,
        engines: &[EffectiveEngine],
        chunk_ids: &[String],
    ) -> EngineReport {
        self.fan_out(engines, "delete_by_chunk_ids", |engine| async move {
            engine.delete_by_chunk_ids(chunk_ids).await
        })
        .await
    }

    pub async fn delete_by_knowledge_base(
        &self,
        engines: &[EffectiveEngine],
        knowledge_base_id: &str,
    ) -> EngineReport {
        self.fan_out(engines, "delete_by_knowledge_base", |engine| async move {
            engine.delete_by_knowledge_base(knowledge_base_id).await
        })
        .await
    }

    pub async fn delete_by_knowledge_ids(
        &self,
        engines: &[EffectiveEngine],
        knowledge_ids: &[String],
    ) -> EngineReport {
        self.fan_out(engines, "delete_by_knowledge_ids", |engine| async move {
            engine.delete_by_knowledge_ids(knowledge_ids).await
        })
        .await
    }

    pub async fn copy_indices(
        &self,
        engines: &[EffectiveEngine],
        target_knowledge_base_id: &str,
        copies: &[IndexCopy],
    ) -> EngineReport {
        self.fan_out(engines, "copy_indices", |engine| async move {
            engine
                .copy_indices(target_knowledge_base_id, copies)
                .await
        })
        .await
    }
}

/// `Ok` when every engine succeeded, otherwise `PartialEngineFailure`.
pub fn into_result(report: EngineReport) -> Result<EngineReport, AppError> {
    if report.is_complete() {
        Ok(report)
    } else {
        Err(AppError::PartialEngineFailure(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::engine::RetrieverType;

    fn entry(chunk_id: &str, knowledge_id: &str) -> IndexEntry {
        IndexEntry {
            source_id: chunk_id.into(),
            chunk_id: chunk_id.into(),
            knowledge_id: knowledge_id.into(),
            knowledge_base_id: "kb-1".into(),
            content: format!("content of {chunk_id}"),
            embedding: vec![0.1, 0.2],
            is_enabled: true,
        }
    }

    fn two_engines() -> (EngineRegistry, Arc<InMemoryEngine>, Arc<InMemoryEngine>) {
        let keywords = Arc::new(InMemoryEngine::new(EffectiveEngine::new(
            "elasticsearch",
            RetrieverType::Keywords,
        )));
        let vector = Arc::new(InMemoryEngine::new(EffectiveEngine::new(
            "postgres",
            RetrieverType::Vector,
        )));
        let mut registry = EngineRegistry::new();
        registry.register(Arc::clone(&keywords) as Arc<dyn RetrievalEngine>, true);
        registry.register(Arc::clone(&vector) as Arc<dyn RetrievalEngine>, true);
        (registry, keywords, vector)
    }

    #[tokio::test]
    async fn one_failing_engine_does_not_stop_the_other() {
        let (registry, keywords, vector) = two_engines();
        let engines = registry.defaults().to_vec();
        let entries = vec![entry("c1", "k1"), entry("c2", "k1")];
        assert!(registry.index(&engines, &entries).await.is_complete());

        keywords.set_failing(true);
        let report = registry
            .delete_by_chunk_ids(&engines, &["c1".to_string()])
            .await;

        assert_eq!(report.succeeded, vec![vector.engine().clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].engine.name(), "elasticsearch:keywords");
        assert_eq!(vector.len().await, 1);
        assert_eq!(keywords.len().await, 2);
        assert!(matches!(
            into_result(report),
            Err(AppError::PartialEngineFailure(_))
        ));
    }

    #[tokio::test]
    async fn unknown_engine_is_reported_as_failure() {
        let (registry, _, _) = two_engines();
        let unknown = EffectiveEngine::new("milvus", RetrieverType::Vector);
        let report = registry
            .delete_by_knowledge_base(&[unknown.clone()], "kb-1")
            .await;
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed_engines(), vec![unknown]);
    }

    #[tokio::test]
    async fn copy_indices_duplicates_entries_under_new_ids() {
        let (registry, keywords, _) = two_engines();
        let engines = registry.defaults().to_vec();
        let mut question = entry("c1", "k1");
        question.source_id = "c1-q1".into();
        registry
            .index(&engines, &[entry("c1", "k1"), question])
            .await;

        let report = registry
            .copy_indices(
                &engines,
                "kb-2",
                &[IndexCopy {
                    source_chunk_id: "c1".into(),
                    target_chunk_id: "c1-copy".into(),
                    target_knowledge_id: "k1-copy".into(),
                }],
            )
            .await;
        assert!(report.is_complete());
        let copied = keywords.entries_for_chunk("c1-copy").await;
        assert_eq!(copied.len(), 2);
        assert!(copied.iter().all(|e| e.knowledge_base_id == "kb-2"));

        registry
            .delete_by_knowledge_ids(&engines, &["k1".to_string()])
            .await;
        assert_eq!(keywords.len().await, 2);
    }

    #[test]
    fn registry_from_config_parses_engine_specs() {
        let config = AppConfig {
            retrieval_engines: vec!["postgres:keywords".into(), "qdrant:vector".into()],
            ..AppConfig::default()
        };
        let registry = EngineRegistry::from_config(&config).expect("registry");
        assert_eq!(registry.defaults().len(), 2);
        assert!(registry
            .get(&EffectiveEngine::new("qdrant", RetrieverType::Vector))
            .is_some());
    }
}
