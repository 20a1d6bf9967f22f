use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::engine::{EffectiveEngine, RetrieverType},
    utils::{
        chat::{terminated, ChatEvent, ChatMessage, ChatModel, ChatOptions, ChatResponse, ChatStream},
        config::AppConfig,
    },
};
use tokio::sync::Mutex;

use crate::{
    engines::{EngineRegistry, InMemoryEngine, RetrievalEngine},
    services::IngestionServices,
};

/// Chat double that replays queued replies and records every request.
#[derive(Default)]
pub struct ScriptedChat {
    replies: Mutex<VecDeque<Result<String, String>>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chat = Self::new();
        chat.replies
            .try_lock()
            .expect("fresh mutex")
            .extend(replies.into_iter().map(|reply| Ok(reply.into())));
        chat
    }

    pub async fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().await.push_back(Ok(reply.into()));
    }

    pub async fn push_error(&self, message: impl Into<String>) {
        self.replies.lock().await.push_back(Err(message.into()));
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    async fn next_reply(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        self.calls.lock().await.push(messages.to_vec());
        match self.replies.lock().await.pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(AppError::Processing(message)),
            None => Err(AppError::Processing("no scripted reply left".into())),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, AppError> {
        let content = self.next_reply(messages).await?;
        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
        })
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        _options: ChatOptions,
    ) -> Result<ChatStream, AppError> {
        let event = match self.next_reply(&messages).await {
            Ok(content) => ChatEvent::Answer(content),
            Err(err) => ChatEvent::Error(err.to_string()),
        };
        Ok(terminated(futures::stream::iter(vec![event])))
    }
}

/// In-memory services with two default engines the test can reach into.
pub struct TestHarness {
    pub services: Arc<IngestionServices>,
    pub chat: Arc<ScriptedChat>,
    pub keywords: Arc<InMemoryEngine>,
    pub vector: Arc<InMemoryEngine>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        embedding_dimensions: 32,
        chunk_size: 64,
        chunk_overlap: 8,
        faq_batch_size: 2,
        retrieval_engines: Vec::new(),
        ..AppConfig::default()
    }
}

pub fn harness_with(config: AppConfig, chat: ScriptedChat) -> TestHarness {
    let keywords = Arc::new(InMemoryEngine::new(EffectiveEngine::new(
        "elasticsearch",
        RetrieverType::Keywords,
    )));
    let vector = Arc::new(InMemoryEngine::new(EffectiveEngine::new(
        "postgres",
        RetrieverType::Vector,
    )));
    let mut engines = EngineRegistry::new();
    engines.register(Arc::clone(&keywords) as Arc<dyn RetrievalEngine>, true);
    engines.register(Arc::clone(&vector) as Arc<dyn RetrievalEngine>, true);

    let chat = Arc::new(chat);
    let services = IngestionServices::in_memory(config, Arc::clone(&chat) as Arc<dyn ChatModel>)
        .expect("in-memory services")
        .with_engines(engines);

    TestHarness {
        services: Arc::new(services),
        chat,
        keywords,
        vector,
    }
}

pub fn harness(chat: ScriptedChat) -> TestHarness {
    harness_with(test_config(), chat)
}
