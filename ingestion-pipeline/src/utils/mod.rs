pub mod llm_instructions;
pub mod url_text_retrieval;

use std::collections::HashMap;

use common::{
    error::AppError,
    utils::chat::{ChatMessage, ChatModel, ChatOptions, JsonSchemaFormat},
};
use serde::de::DeserializeOwned;

use crate::graph::entity_chunk_id;

/// Maps node names produced by graph extraction to entity chunk ids.
#[derive(Clone)]
pub struct GraphMapper {
    knowledge_id: String,
    pub key_to_id: HashMap<String, String>,
}

impl GraphMapper {
    pub fn new(knowledge_id: impl Into<String>) -> Self {
        Self {
            knowledge_id: knowledge_id.into(),
            key_to_id: HashMap::new(),
        }
    }

    fn normalize(key: &str) -> String {
        key.trim().to_lowercase()
    }

    /// Assigns the entity chunk id for a node name. Repeated names map to one id.
    pub fn assign_id(&mut self, key: &str) -> String {
        let id = entity_chunk_id(&self.knowledge_id, key.trim());
        self.key_to_id.insert(Self::normalize(key), id.clone());
        id
    }

    /// Looks up a node that was assigned earlier.
    pub fn get_id(&self, key: &str) -> Result<String, AppError> {
        self.key_to_id
            .get(&Self::normalize(key))
            .cloned()
            .ok_or_else(|| AppError::LLMParsing(format!("relation references unknown node '{key}'")))
    }
}

/// Ask the chat model for a reply matching `schema` and decode it.
pub async fn structured_completion<T: DeserializeOwned>(
    chat: &dyn ChatModel,
    system: &str,
    user: String,
    schema_name: &str,
    schema: serde_json::Value,
) -> Result<T, AppError> {
    let options = ChatOptions {
        temperature: Some(0.2),
        json_schema: Some(JsonSchemaFormat {
            name: schema_name.to_string(),
            description: None,
            schema,
        }),
    };
    let response = chat
        .chat(&[ChatMessage::system(system), ChatMessage::user(user)], &options)
        .await?;

    if response.content.trim().is_empty() {
        return Err(AppError::LLMParsing(
            "No content found in LLM response".into(),
        ));
    }

    serde_json::from_str::<T>(&response.content).map_err(|e| {
        AppError::LLMParsing(format!(
            "Failed to parse LLM response into {schema_name}: {e}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_is_case_insensitive_and_stable() {
        let mut mapper = GraphMapper::new("k-1");
        let id = mapper.assign_id("Rust ");
        assert_eq!(mapper.get_id("rust").expect("known"), id);
        assert_eq!(GraphMapper::new("k-1").assign_id("rust"), id);
        assert!(matches!(
            mapper.get_id("Go"),
            Err(AppError::LLMParsing(_))
        ));
    }
}
