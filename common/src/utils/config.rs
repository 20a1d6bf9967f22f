use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    /// Name of a registered model provider, e.g. "generic" or "ollama".
    #[serde(default = "default_chat_provider")]
    pub chat_provider: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    /// When unset the worker keeps progress and the queue in process memory.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_task_max_attempts")]
    pub task_max_attempts: u32,
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
    #[serde(default = "default_running_lock_ttl_secs")]
    pub running_lock_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_running_lock_ttl_secs")]
    pub sweep_max_age_secs: u64,
    /// Claimed envelopes not acknowledged within this window go back to the queue.
    #[serde(default = "default_running_lock_ttl_secs")]
    pub task_lease_secs: u64,
    #[serde(default = "default_faq_inline_payload_bytes")]
    pub faq_inline_payload_bytes: usize,
    #[serde(default = "default_faq_inline_result_limit")]
    pub faq_inline_result_limit: usize,
    #[serde(default = "default_faq_batch_size")]
    pub faq_batch_size: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_chunk_separators")]
    pub chunk_separators: Vec<String>,
    /// Engines written to by document processing, formatted `engine_type:retriever_type`.
    #[serde(default = "default_retrieval_engines")]
    pub retrieval_engines: Vec<String>,
    #[serde(default)]
    pub url_fetch_allow_private: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            chat_provider: default_chat_provider(),
            chat_model: default_chat_model(),
            embedding_backend: default_embedding_backend(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            data_dir: default_data_dir(),
            storage: default_storage_kind(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            worker_concurrency: default_worker_concurrency(),
            task_max_attempts: default_task_max_attempts(),
            progress_ttl_secs: default_progress_ttl_secs(),
            running_lock_ttl_secs: default_running_lock_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_max_age_secs: default_running_lock_ttl_secs(),
            task_lease_secs: default_running_lock_ttl_secs(),
            faq_inline_payload_bytes: default_faq_inline_payload_bytes(),
            faq_inline_result_limit: default_faq_inline_result_limit(),
            faq_batch_size: default_faq_batch_size(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            chunk_separators: default_chunk_separators(),
            retrieval_engines: default_retrieval_engines(),
            url_fetch_allow_private: false,
        }
    }
}

fn default_chat_provider() -> String {
    "generic".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_backend() -> String {
    "hashed".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_key_prefix() -> String {
    "ingest".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_task_max_attempts() -> u32 {
    3
}

fn default_progress_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_running_lock_ttl_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_faq_inline_payload_bytes() -> usize {
    256 * 1024
}

fn default_faq_inline_result_limit() -> usize {
    100
}

fn default_faq_batch_size() -> usize {
    50
}

fn default_chunk_size() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_chunk_separators() -> Vec<String> {
    vec!["\n\n".to_string(), "\n".to_string(), "。".to_string()]
}

fn default_retrieval_engines() -> Vec<String> {
    vec!["postgres:keywords".to_string(), "postgres:vector".to_string()]
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::default()
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("retrieval_engines"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_falls_back_to_defaults() {
        let config: AppConfig = Config::builder()
            .build()
            .and_then(Config::try_deserialize)
            .expect("deserialize defaults");

        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.chunk_overlap, 50);
        assert_eq!(config.chunk_separators.len(), 3);
        assert!(config.redis_url.is_none());
        assert_eq!(config.storage, StorageKind::Local);
        assert_eq!(config.sweep_max_age_secs, config.running_lock_ttl_secs);
        assert_eq!(config.task_lease_secs, config.running_lock_ttl_secs);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: AppConfig = Config::builder()
            .set_override("storage", "memory")
            .and_then(|b| b.set_override("faq_batch_size", 10))
            .and_then(|b| b.set_override("redis_url", "redis://127.0.0.1/"))
            .and_then(config::ConfigBuilder::<config::builder::DefaultState>::build)
            .and_then(Config::try_deserialize)
            .expect("deserialize overrides");

        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.faq_batch_size, 10);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
    }
}
