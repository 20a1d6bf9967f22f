use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

use super::faq::FaqChunkMetadata;

/// Namespace for every deterministic id derived by the pipeline.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_9a52_3d7e_4b8a_a1f0_2c5e_7d90_b3e4);

/// Derive a stable id from its parts, so redelivered tasks write the same rows.
pub fn deterministic_id(parts: &[&str]) -> String {
    Uuid::new_v5(&CHUNK_NAMESPACE, parts.join("\u{1f}").as_bytes()).to_string()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    #[default]
    Text,
    ImageOcr,
    ImageCaption,
    Summary,
    Entity,
    Relationship,
    Faq,
    WebSearch,
    TableSummary,
    TableColumn,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::ImageOcr => "image_ocr",
            ChunkType::ImageCaption => "image_caption",
            ChunkType::Summary => "summary",
            ChunkType::Entity => "entity",
            ChunkType::Relationship => "relationship",
            ChunkType::Faq => "faq",
            ChunkType::WebSearch => "web_search",
            ChunkType::TableSummary => "table_summary",
            ChunkType::TableColumn => "table_column",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ChunkType::ImageOcr | ChunkType::ImageCaption)
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence progress of a chunk. Stored as its integer code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ChunkStatus {
    #[default]
    Default,
    Stored,
    Indexed,
}

impl From<ChunkStatus> for u8 {
    fn from(status: ChunkStatus) -> Self {
        match status {
            ChunkStatus::Default => 0,
            ChunkStatus::Stored => 1,
            ChunkStatus::Indexed => 2,
        }
    }
}

impl TryFrom<u8> for ChunkStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChunkStatus::Default),
            1 => Ok(ChunkStatus::Stored),
            2 => Ok(ChunkStatus::Indexed),
            other => Err(format!("unknown chunk status {other}")),
        }
    }
}

/// Capability bits carried by a chunk. Unknown bits are preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkFlags(u32);

impl ChunkFlags {
    pub const RECOMMENDED: ChunkFlags = ChunkFlags(1);
    pub const NONE: ChunkFlags = ChunkFlags(0);

    pub fn from_bits(bits: u32) -> Self {
        ChunkFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn has(self, flag: ChunkFlags) -> bool {
        self.0 & flag.0 != 0
    }

    #[must_use]
    pub fn set(self, flag: ChunkFlags) -> Self {
        ChunkFlags(self.0 | flag.0)
    }

    #[must_use]
    pub fn clear(self, flag: ChunkFlags) -> Self {
        ChunkFlags(self.0 & !flag.0)
    }

    #[must_use]
    pub fn toggle(self, flag: ChunkFlags) -> Self {
        ChunkFlags(self.0 ^ flag.0)
    }
}

impl Default for ChunkFlags {
    fn default() -> Self {
        ChunkFlags::RECOMMENDED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub url: String,
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub start_pos: usize,
    #[serde(default)]
    pub end_pos: usize,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub ocr_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub id: String,
    pub question: String,
}

/// Metadata any chunk may carry once question generation has run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunkMetadata {
    #[serde(default)]
    pub generated_questions: Vec<GeneratedQuestion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChunkMetadata {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub column_name: Option<String>,
    #[serde(default)]
    pub column_type: Option<String>,
}

/// Shape of `Chunk::metadata`, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkMetadata {
    Faq(FaqChunkMetadata),
    Document(DocumentChunkMetadata),
    Table(TableChunkMetadata),
}

impl ChunkMetadata {
    pub fn kind(&self) -> &'static str {
        match self {
            ChunkMetadata::Faq(_) => "faq",
            ChunkMetadata::Document(_) => "document",
            ChunkMetadata::Table(_) => "table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    #[serde(default)]
    pub seq_id: i64,
    pub tenant_id: u64,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    #[serde(default)]
    pub tag_id: Option<String>,
    pub content: String,
    pub chunk_index: usize,
    pub is_enabled: bool,
    #[serde(default)]
    pub flags: ChunkFlags,
    #[serde(default)]
    pub status: ChunkStatus,
    pub start_at: usize,
    pub end_at: usize,
    #[serde(default)]
    pub pre_chunk_id: Option<String>,
    #[serde(default)]
    pub next_chunk_id: Option<String>,
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub parent_chunk_id: Option<String>,
    #[serde(default)]
    pub relation_chunks: Vec<String>,
    #[serde(default)]
    pub indirect_relation_chunks: Vec<String>,
    #[serde(default)]
    pub metadata: Option<ChunkMetadata>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_info: Vec<ImageInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(
        id: String,
        tenant_id: u64,
        knowledge_base_id: &str,
        knowledge_id: &str,
        chunk_type: ChunkType,
        content: String,
    ) -> Self {
        let now = Utc::now();
        let end_at = content.chars().count();
        Self {
            id,
            seq_id: 0,
            tenant_id,
            knowledge_id: knowledge_id.to_string(),
            knowledge_base_id: knowledge_base_id.to_string(),
            tag_id: None,
            content,
            chunk_index: 0,
            is_enabled: true,
            flags: ChunkFlags::default(),
            status: ChunkStatus::Default,
            start_at: 0,
            end_at,
            pre_chunk_id: None,
            next_chunk_id: None,
            chunk_type,
            parent_chunk_id: None,
            relation_chunks: Vec::new(),
            indirect_relation_chunks: Vec::new(),
            metadata: None,
            content_hash: None,
            image_info: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Advance the status. Regressions are ignored; use `reset_status` when reprocessing.
    pub fn advance_status(&mut self, status: ChunkStatus) {
        if status > self.status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    pub fn reset_status(&mut self) {
        self.status = ChunkStatus::Default;
        self.updated_at = Utc::now();
    }

    pub fn faq_metadata(&self) -> Option<&FaqChunkMetadata> {
        match &self.metadata {
            Some(ChunkMetadata::Faq(meta)) => Some(meta),
            _ => None,
        }
    }

    pub fn document_metadata(&self) -> Option<&DocumentChunkMetadata> {
        match &self.metadata {
            Some(ChunkMetadata::Document(meta)) => Some(meta),
            _ => None,
        }
    }

    /// Check that the metadata variant is allowed for this chunk type.
    pub fn validate_metadata(&self) -> Result<(), AppError> {
        let allowed = match (&self.chunk_type, &self.metadata) {
            (_, None) => !matches!(self.chunk_type, ChunkType::Faq),
            (ChunkType::Faq, Some(ChunkMetadata::Faq(_)))
            | (_, Some(ChunkMetadata::Document(_))) => true,
            (ChunkType::TableSummary | ChunkType::TableColumn, Some(ChunkMetadata::Table(_))) => {
                true
            }
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "chunk {} of type {} cannot carry {} metadata",
                self.id,
                self.chunk_type,
                self.metadata.as_ref().map_or("no", ChunkMetadata::kind)
            )))
        }
    }
}

impl FromStr for ChunkType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ChunkType::Text),
            "image_ocr" => Ok(ChunkType::ImageOcr),
            "image_caption" => Ok(ChunkType::ImageCaption),
            "summary" => Ok(ChunkType::Summary),
            "entity" => Ok(ChunkType::Entity),
            "relationship" => Ok(ChunkType::Relationship),
            "faq" => Ok(ChunkType::Faq),
            "web_search" => Ok(ChunkType::WebSearch),
            "table_summary" => Ok(ChunkType::TableSummary),
            "table_column" => Ok(ChunkType::TableColumn),
            other => Err(AppError::Validation(format!("unknown chunk type {other}"))),
        }
    }
}
