use std::collections::BTreeMap;
use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use futures::{stream::BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Structured-output request: the reply must match `schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchemaFormat {
    pub name: String,
    pub description: Option<String>,
    pub schema: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub json_schema: Option<JsonSchemaFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// One event of a streamed chat reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Answer(String),
    ToolCalls(Vec<ToolCall>),
    Error(String),
    Done,
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done | ChatEvent::Error(_))
    }
}

/// Lazy, single-consumer event stream. Ends with exactly one `Done` or `Error`.
pub type ChatStream = BoxStream<'static, ChatEvent>;

/// Wrap a raw event stream so it stops after the first terminal event and
/// always emits one, even when the source ends early.
pub fn terminated<S>(source: S) -> ChatStream
where
    S: Stream<Item = ChatEvent> + Send + 'static,
{
    async_stream::stream! {
        futures::pin_mut!(source);
        while let Some(event) = source.next().await {
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                return;
            }
        }
        yield ChatEvent::Done;
    }
    .boxed()
}

/// Drain a stream into a single response. An `Error` event becomes `AppError::Processing`.
pub async fn collect_stream(mut stream: ChatStream) -> Result<ChatResponse, AppError> {
    let mut response = ChatResponse::default();
    while let Some(event) = stream.next().await {
        match event {
            ChatEvent::Answer(text) => response.content.push_str(&text),
            ChatEvent::ToolCalls(calls) => response.tool_calls.extend(calls),
            ChatEvent::Error(message) => return Err(AppError::Processing(message)),
            ChatEvent::Done => break,
        }
    }
    Ok(response)
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError>;

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<ChatStream, AppError>;
}

/// Chat over any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiCompatibleChat {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiCompatibleChat {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_endpoint(base_url: &str, api_key: &str, model: impl Into<String>) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(base_url),
        );
        Self::new(Arc::new(client), model)
    }

    fn request_messages(
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, AppError> {
        messages
            .iter()
            .map(|message| {
                Ok(match message.role {
                    ChatRole::System => {
                        ChatCompletionRequestSystemMessage::from(message.content.as_str()).into()
                    }
                    ChatRole::User => {
                        ChatCompletionRequestUserMessage::from(message.content.as_str()).into()
                    }
                    ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content.as_str())
                        .build()?
                        .into(),
                })
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, AppError> {
        let mut request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::request_messages(messages)?)
            .build()?;

        request.temperature = options.temperature;
        if stream {
            request.stream = Some(true);
        }
        if let Some(format) = &options.json_schema {
            request.response_format = Some(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: format.description.clone(),
                    name: format.name.clone(),
                    schema: Some(format.schema.clone()),
                    strict: Some(true),
                },
            });
        }
        Ok(request)
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl ChatModel for OpenAiCompatibleChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError> {
        let request = self.build_request(messages, options, false)?;
        let response = self.client.chat().create(request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMParsing("No choices found in LLM response".into()))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
        })
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<ChatStream, AppError> {
        let request = self.build_request(&messages, &options, true)?;
        let mut upstream = self.client.chat().create_stream(request).await?;
        let model = self.model.clone();

        let events = async_stream::stream! {
            let mut pending_calls: BTreeMap<u32, PartialToolCall> = BTreeMap::new();

            while let Some(item) = upstream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        error!(%model, error = %err, "chat stream failed");
                        yield ChatEvent::Error(err.to_string());
                        return;
                    }
                };

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield ChatEvent::Answer(content);
                        }
                    }

                    for call in choice.delta.tool_calls.unwrap_or_default() {
                        let entry = pending_calls.entry(call.index).or_default();
                        if let Some(id) = call.id {
                            entry.id = id;
                        }
                        if let Some(function) = call.function {
                            if let Some(name) = function.name {
                                entry.name.push_str(&name);
                            }
                            if let Some(arguments) = function.arguments {
                                entry.arguments.push_str(&arguments);
                            }
                        }
                    }

                    if choice.finish_reason.is_some() && !pending_calls.is_empty() {
                        let calls = std::mem::take(&mut pending_calls)
                            .into_values()
                            .map(|partial| ToolCall {
                                id: partial.id,
                                name: partial.name,
                                arguments: partial.arguments,
                            })
                            .collect();
                        yield ChatEvent::ToolCalls(calls);
                    }
                }
            }

            debug!(%model, "chat stream finished");
            yield ChatEvent::Done;
        };

        Ok(terminated(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn stream_stops_after_first_terminal_event() {
        let source = stream::iter(vec![
            ChatEvent::Answer("Hel".into()),
            ChatEvent::Answer("lo".into()),
            ChatEvent::Error("upstream closed".into()),
            ChatEvent::Answer("ignored".into()),
        ]);

        let events: Vec<ChatEvent> = terminated(source).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], ChatEvent::Error("upstream closed".into()));
    }

    #[tokio::test]
    async fn stream_without_terminal_event_gets_done() {
        let source = stream::iter(vec![ChatEvent::Answer("only".into())]);
        let events: Vec<ChatEvent> = terminated(source).collect().await;
        assert_eq!(events, vec![ChatEvent::Answer("only".into()), ChatEvent::Done]);
    }

    #[tokio::test]
    async fn collect_stream_joins_answers_and_tool_calls() {
        let source = stream::iter(vec![
            ChatEvent::Answer("a".into()),
            ChatEvent::ToolCalls(vec![ToolCall {
                id: "1".into(),
                name: "search".into(),
                arguments: "{}".into(),
            }]),
            ChatEvent::Answer("b".into()),
            ChatEvent::Done,
        ]);

        let response = collect_stream(terminated(source)).await.expect("collect");
        assert_eq!(response.content, "ab");
        assert_eq!(response.tool_calls.len(), 1);

        let failing = stream::iter(vec![ChatEvent::Error("boom".into())]);
        assert!(collect_stream(terminated(failing)).await.is_err());
    }
}
