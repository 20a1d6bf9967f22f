use serde_json::json;

pub static QUESTION_GENERATION_SYSTEM_MESSAGE: &str = r#"You write the questions a reader would ask that the given passage answers. Each question must be answerable from the passage alone, phrased the way a user would type it into a search box, and must not repeat another question in the list. Use the language of the passage. Return exactly the requested number of questions unless the passage cannot support that many."#;

pub static SUMMARY_SYSTEM_MESSAGE: &str = r#"You summarise documents for a knowledge base. Given the opening sections of a document, write a neutral summary of what the document covers in at most five sentences. Mention the key entities, products, or procedures it describes. Use the language of the document and do not invent facts that are not present."#;

pub static GRAPH_EXTRACTION_SYSTEM_MESSAGE: &str = r#"You extract a small knowledge graph from a passage. Identify the important entities (people, organisations, products, concepts, places) as nodes, each with a short list of attributes stated in the passage. Then list the relationships between those nodes, naming each relationship with a short verb phrase. Only use node names that appear in your node list. The surrounding passages are context only; extract from the main passage."#;

pub static TABLE_SUMMARY_SYSTEM_MESSAGE: &str = r#"You describe tabular data for a knowledge base. Given a table's header and sample rows, write a short summary of what the table records and describe every column: its name, the kind of values it holds, and what it means. Keep column names exactly as they appear in the header."#;

pub fn question_generation_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "questions": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["questions"],
        "additionalProperties": false
    })
}

pub fn summary_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" }
        },
        "required": ["summary"],
        "additionalProperties": false
    })
}

pub fn graph_extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "node": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "attributes": {
                            "type": "array",
                            "items": { "type": "string" }
                        }
                    },
                    "required": ["name", "attributes"],
                    "additionalProperties": false
                }
            },
            "relation": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "node1": { "type": "string" },
                        "node2": { "type": "string" },
                        "type": { "type": "string" }
                    },
                    "required": ["node1", "node2", "type"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["node", "relation"],
        "additionalProperties": false
    })
}

pub fn table_summary_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "columns": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "column_type": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["name", "column_type", "description"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["summary", "columns"],
        "additionalProperties": false
    })
}
