use std::{str::FromStr, sync::Arc};

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{error::AppError, utils::config::AppConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingBackend {
    OpenAI,
    /// Token-bucket vectors; deterministic and offline.
    #[default]
    Hashed,
}

impl FromStr for EmbeddingBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hashed" => Ok(Self::Hashed),
            other => Err(AppError::Validation(format!(
                "unknown embedding backend '{other}', expected 'openai' or 'hashed'"
            ))),
        }
    }
}

/// Turns chunk text and generated questions into vectors for the vector engines.
#[derive(Clone)]
pub struct EmbeddingProvider {
    backend: Backend,
    dimensions: u32,
}

#[derive(Clone)]
enum Backend {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
    },
    Hashed,
}

impl EmbeddingProvider {
    pub fn new_openai(client: Arc<Client<OpenAIConfig>>, model: String, dimensions: u32) -> Self {
        Self {
            backend: Backend::OpenAI { client, model },
            dimensions: dimensions.max(1),
        }
    }

    pub fn new_hashed(dimensions: usize) -> Self {
        Self {
            backend: Backend::Hashed,
            dimensions: u32::try_from(dimensions.max(1)).unwrap_or(u32::MAX),
        }
    }

    /// Build the backend named by `embedding_backend`.
    pub fn from_config(
        config: &AppConfig,
        client: Arc<Client<OpenAIConfig>>,
    ) -> Result<Self, AppError> {
        Ok(match config.embedding_backend.parse()? {
            EmbeddingBackend::OpenAI => Self::new_openai(
                client,
                config.embedding_model.clone(),
                config.embedding_dimensions,
            ),
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimensions as usize),
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            Backend::OpenAI { .. } => "openai",
            Backend::Hashed => "hashed",
        }
    }

    /// One vector per input, in input order.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match &self.backend {
            Backend::Hashed => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, self.dimensions as usize))
                .collect()),
            Backend::OpenAI { client, model } => {
                let expected = texts.len();
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(self.dimensions)
                    .build()?;
                let mut data = client.embeddings().create(request).await?.data;
                if data.len() != expected {
                    return Err(AppError::Processing(format!(
                        "embedding provider returned {} vectors for {expected} inputs",
                        data.len()
                    )));
                }
                data.sort_by_key(|item| item.index);
                debug!(count = expected, %model, "embeddings created");
                Ok(data.into_iter().map(|item| item.embedding).collect())
            }
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embed_batch(vec![text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| AppError::Processing("no embedding returned".into()))
    }
}

/// Lowercased alphanumeric tokens counted into `dimensions` buckets, L2-normalised.
fn hashed_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    let tokens = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase);
    for token in tokens {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(prefix) % dimensions as u64) as usize;
        if let Some(value) = vector.get_mut(slot) {
            *value += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embeddings_are_normalized_and_case_insensitive() {
        let provider = EmbeddingProvider::new_hashed(32);
        let a = provider.embed("Reset your password").await.expect("embed");
        let b = provider.embed("reset YOUR password").await.expect("embed");

        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_empty_text_is_zero() {
        let provider = EmbeddingProvider::new_hashed(16);
        let batch = provider
            .embed_batch(vec!["alpha beta".into(), String::new()])
            .await
            .expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], provider.embed("alpha beta").await.expect("embed"));
        assert!(batch[1].iter().all(|v| *v == 0.0));
        assert!(provider.embed_batch(Vec::new()).await.expect("empty").is_empty());
    }

    #[test]
    fn parses_backend_names() {
        assert_eq!(
            "OpenAI".parse::<EmbeddingBackend>().expect("parse"),
            EmbeddingBackend::OpenAI
        );
        assert!(matches!(
            "word2vec".parse::<EmbeddingBackend>(),
            Err(AppError::Validation(_))
        ));
    }
}
