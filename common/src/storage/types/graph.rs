use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub chunks: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRelation {
    #[serde(default)]
    pub node1: String,
    #[serde(default)]
    pub node2: String,
    #[serde(default, rename = "type")]
    pub relation_type: String,
}

/// Entities and relations extracted from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphData {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub node: Vec<GraphNode>,
    #[serde(default)]
    pub relation: Vec<GraphRelation>,
}

impl GraphData {
    /// Drop nameless nodes and relations whose endpoints are not known nodes.
    pub fn sanitize(&mut self) {
        self.node.retain(|node| !node.name.trim().is_empty());
        let names: Vec<&str> = self.node.iter().map(|n| n.name.as_str()).collect();
        self.relation.retain(|relation| {
            names.contains(&relation.node1.as_str()) && names.contains(&relation.node2.as_str())
        });
    }
}

/// Neighbouring content handed to extraction prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContext {
    pub chunk_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_content: Option<String>,
}
