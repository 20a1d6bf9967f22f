use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::utils::chat::{ChatModel, OpenAiCompatibleChat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "KnowledgeQA")]
    Chat,
    Embedding,
    Rerank,
    #[serde(rename = "VLLM")]
    Vllm,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelType::Chat => "KnowledgeQA",
            ModelType::Embedding => "Embedding",
            ModelType::Rerank => "Rerank",
            ModelType::Vllm => "VLLM",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub default_urls: BTreeMap<ModelType, &'static str>,
    pub model_types: Vec<ModelType>,
    pub requires_auth: bool,
}

impl ProviderInfo {
    pub fn supports(&self, model_type: ModelType) -> bool {
        self.model_types.contains(&model_type)
    }
}

/// Connection settings a user supplies for one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model_name: String,
}

pub trait ModelProvider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    fn validate_config(&self, config: &ProviderConfig) -> Result<(), AppError>;
}

/// A provider fully described by its metadata and which fields it requires.
struct OpenAiStyleProvider {
    info: ProviderInfo,
    label: &'static str,
    requires_base_url: bool,
}

impl ModelProvider for OpenAiStyleProvider {
    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }

    fn validate_config(&self, config: &ProviderConfig) -> Result<(), AppError> {
        if self.requires_base_url && config.base_url.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "base URL is required for {} provider",
                self.label
            )));
        }
        if self.info.requires_auth && config.api_key.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "API key is required for {} provider",
                self.label
            )));
        }
        if config.model_name.trim().is_empty() {
            return Err(AppError::Validation("model name is required".into()));
        }
        Ok(())
    }
}

fn urls(entries: &[(ModelType, &'static str)]) -> BTreeMap<ModelType, &'static str> {
    entries.iter().copied().collect()
}

const ALL_TYPES: [ModelType; 4] = [
    ModelType::Chat,
    ModelType::Embedding,
    ModelType::Rerank,
    ModelType::Vllm,
];

fn generic() -> Box<dyn ModelProvider> {
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "generic",
            display_name: "Custom (OpenAI Compatible)",
            description: "Generic API endpoint (OpenAI-compatible)",
            default_urls: BTreeMap::new(),
            model_types: ALL_TYPES.to_vec(),
            requires_auth: false,
        },
        label: "generic",
        requires_base_url: true,
    })
}

fn ollama() -> Box<dyn ModelProvider> {
    const URL: &str = "http://localhost:11434/v1";
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "ollama",
            display_name: "Ollama",
            description: "Locally served models through the Ollama runtime",
            default_urls: urls(&[
                (ModelType::Chat, URL),
                (ModelType::Embedding, URL),
                (ModelType::Vllm, URL),
            ]),
            model_types: vec![ModelType::Chat, ModelType::Embedding, ModelType::Vllm],
            requires_auth: false,
        },
        label: "Ollama",
        requires_base_url: false,
    })
}

fn moonshot() -> Box<dyn ModelProvider> {
    const URL: &str = "https://api.moonshot.ai/v1";
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "moonshot",
            display_name: "Moonshot AI",
            description: "kimi-k2-turbo-preview, moonshot-v1-8k-vision-preview, etc.",
            default_urls: urls(&[(ModelType::Chat, URL), (ModelType::Vllm, URL)]),
            model_types: vec![ModelType::Chat, ModelType::Vllm],
            requires_auth: true,
        },
        label: "Moonshot",
        requires_base_url: true,
    })
}

fn qianfan() -> Box<dyn ModelProvider> {
    const URL: &str = "https://qianfan.baidubce.com/v2";
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "qianfan",
            display_name: "Baidu Qianfan",
            description: "ernie-5.0-thinking-preview, embedding-v1, bce-reranker-base, etc.",
            default_urls: urls(&[
                (ModelType::Chat, URL),
                (ModelType::Embedding, URL),
                (ModelType::Rerank, URL),
                (ModelType::Vllm, URL),
            ]),
            model_types: ALL_TYPES.to_vec(),
            requires_auth: true,
        },
        label: "Qianfan",
        requires_base_url: true,
    })
}

fn lkeap() -> Box<dyn ModelProvider> {
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "lkeap",
            display_name: "Tencent Cloud LKEAP",
            description: "DeepSeek-R1, DeepSeek-V3 series models with thinking chain support",
            default_urls: urls(&[(ModelType::Chat, "https://api.lkeap.cloud.tencent.com/v1")]),
            model_types: vec![ModelType::Chat],
            requires_auth: true,
        },
        label: "LKEAP",
        requires_base_url: false,
    })
}

fn modelscope() -> Box<dyn ModelProvider> {
    const URL: &str = "https://api-inference.modelscope.cn/v1";
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "modelscope",
            display_name: "ModelScope",
            description: "Qwen/Qwen3-8B, Qwen/Qwen3-Embedding-8B, etc.",
            default_urls: urls(&[
                (ModelType::Chat, URL),
                (ModelType::Embedding, URL),
                (ModelType::Vllm, URL),
            ]),
            model_types: vec![ModelType::Chat, ModelType::Embedding, ModelType::Vllm],
            requires_auth: true,
        },
        label: "ModelScope",
        requires_base_url: true,
    })
}

fn longcat() -> Box<dyn ModelProvider> {
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "longcat",
            display_name: "LongCat AI",
            description: "LongCat-Flash-Chat, LongCat-Flash-Thinking, etc.",
            default_urls: urls(&[(ModelType::Chat, "https://api.longcat.chat/openai/v1")]),
            model_types: vec![ModelType::Chat],
            requires_auth: true,
        },
        label: "LongCat",
        requires_base_url: true,
    })
}

fn gpustack() -> Box<dyn ModelProvider> {
    const URL: &str = "http://your_gpustack_server_url/v1-openai";
    // Rerank lives under /v1 rather than the OpenAI-compatible prefix.
    const RERANK_URL: &str = "http://your_gpustack_server_url/v1";
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "gpustack",
            display_name: "GPUStack",
            description: "Choose your deployed model on GPUStack",
            default_urls: urls(&[
                (ModelType::Chat, URL),
                (ModelType::Embedding, URL),
                (ModelType::Rerank, RERANK_URL),
                (ModelType::Vllm, URL),
            ]),
            model_types: ALL_TYPES.to_vec(),
            requires_auth: true,
        },
        label: "GPUStack",
        requires_base_url: true,
    })
}

fn qiniu() -> Box<dyn ModelProvider> {
    Box::new(OpenAiStyleProvider {
        info: ProviderInfo {
            name: "qiniu",
            display_name: "Qiniu",
            description: "deepseek/deepseek-v3.2-251201, z-ai/glm-4.7, etc.",
            default_urls: urls(&[(ModelType::Chat, "https://api.qnaigc.com/v1")]),
            model_types: vec![ModelType::Chat],
            requires_auth: true,
        },
        label: "Qiniu",
        requires_base_url: true,
    })
}

/// Providers available out of the box, in display order.
const BUILTIN_PROVIDERS: [fn() -> Box<dyn ModelProvider>; 9] = [
    generic, ollama, moonshot, qianfan, lkeap, modelscope, longcat, gpustack, qiniu,
];

/// Lookup table from provider name to implementation, built once at start-up.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ModelProvider>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        for constructor in BUILTIN_PROVIDERS {
            registry.register(constructor());
        }
        registry
    }

    /// Add a provider, replacing any existing one with the same name.
    pub fn register(&mut self, provider: Box<dyn ModelProvider>) {
        let name = provider.info().name;
        self.providers.retain(|existing| existing.info().name != name);
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ModelProvider> {
        self.providers
            .iter()
            .find(|provider| provider.info().name == name)
            .map(|provider| provider.as_ref())
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub fn list_for(&self, model_type: ModelType) -> Vec<ProviderInfo> {
        self.list()
            .into_iter()
            .filter(|info| info.supports(model_type))
            .collect()
    }

    pub fn validate(&self, config: &ProviderConfig) -> Result<(), AppError> {
        self.get(&config.provider)
            .ok_or_else(|| AppError::Validation(format!("unknown provider {}", config.provider)))?
            .validate_config(config)
    }

    /// Validate `config` and build a chat model, filling in the provider's default URL.
    pub fn build_chat(&self, config: &ProviderConfig) -> Result<Arc<dyn ChatModel>, AppError> {
        let provider = self
            .get(&config.provider)
            .ok_or_else(|| AppError::Validation(format!("unknown provider {}", config.provider)))?;
        let info = provider.info();
        if !info.supports(ModelType::Chat) {
            return Err(AppError::Validation(format!(
                "provider {} does not serve chat models",
                info.name
            )));
        }

        let mut resolved = config.clone();
        if resolved.base_url.trim().is_empty() {
            if let Some(url) = info.default_urls.get(&ModelType::Chat) {
                resolved.base_url = (*url).to_string();
            }
        }
        provider.validate_config(&resolved)?;

        Ok(Arc::new(OpenAiCompatibleChat::from_endpoint(
            &resolved.base_url,
            &resolved.api_key,
            resolved.model_name,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, base_url: &str, api_key: &str, model: &str) -> ProviderConfig {
        ProviderConfig {
            provider: provider.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model_name: model.into(),
        }
    }

    #[test]
    fn registry_lists_every_builtin_provider() {
        let registry = ProviderRegistry::with_builtin();
        let names: Vec<&str> = registry.list().iter().map(|info| info.name).collect();
        assert_eq!(
            names,
            vec![
                "generic",
                "ollama",
                "moonshot",
                "qianfan",
                "lkeap",
                "modelscope",
                "longcat",
                "gpustack",
                "qiniu"
            ]
        );
    }

    #[test]
    fn gpustack_uses_separate_rerank_url() {
        let registry = ProviderRegistry::with_builtin();
        let info = registry.get("gpustack").expect("gpustack").info();
        assert_eq!(
            info.default_urls.get(&ModelType::Rerank),
            Some(&"http://your_gpustack_server_url/v1")
        );
        assert_eq!(
            info.default_urls.get(&ModelType::Chat),
            Some(&"http://your_gpustack_server_url/v1-openai")
        );
    }

    #[test]
    fn validation_messages_name_the_missing_field() {
        let registry = ProviderRegistry::with_builtin();

        let err = registry
            .validate(&config("moonshot", "", "key", "kimi"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: base URL is required for Moonshot provider"
        );

        let err = registry
            .validate(&config("qiniu", "https://api.qnaigc.com/v1", "", "m"))
            .unwrap_err();
        assert!(err.to_string().contains("API key is required for Qiniu provider"));

        let err = registry
            .validate(&config("generic", "http://localhost", "", ""))
            .unwrap_err();
        assert!(err.to_string().contains("model name is required"));

        assert!(registry
            .validate(&config("lkeap", "", "key", "deepseek-r1"))
            .is_ok());
        assert!(registry
            .validate(&config("generic", "http://localhost:8000/v1", "", "m"))
            .is_ok());
    }

    #[test]
    fn build_chat_fills_default_url_and_rejects_non_chat_providers() {
        let registry = ProviderRegistry::with_builtin();
        let model = registry
            .build_chat(&config("longcat", "", "key", "LongCat-Flash-Chat"))
            .expect("longcat chat");
        assert_eq!(model.model_name(), "LongCat-Flash-Chat");

        assert!(registry.build_chat(&config("unknown", "", "", "m")).is_err());
        assert_eq!(registry.list_for(ModelType::Rerank).len(), 3);
    }
}
