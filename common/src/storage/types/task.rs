use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;

use super::engine::{EffectiveEngine, EngineReport};
use super::faq::{FaqEntryPayload, ImportMode};

pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "chunk:extract")]
    ChunkExtract,
    #[serde(rename = "document:process")]
    DocumentProcess,
    #[serde(rename = "faq:import")]
    FaqImport,
    #[serde(rename = "question:generation")]
    QuestionGeneration,
    #[serde(rename = "summary:generation")]
    SummaryGeneration,
    #[serde(rename = "kb:clone")]
    KbClone,
    #[serde(rename = "index:delete")]
    IndexDelete,
    #[serde(rename = "kb:delete")]
    KbDelete,
    #[serde(rename = "knowledge:list_delete")]
    KnowledgeListDelete,
    #[serde(rename = "datatable:summary")]
    DataTableSummary,
}

impl TaskType {
    pub const ALL: [TaskType; 10] = [
        TaskType::ChunkExtract,
        TaskType::DocumentProcess,
        TaskType::FaqImport,
        TaskType::QuestionGeneration,
        TaskType::SummaryGeneration,
        TaskType::KbClone,
        TaskType::IndexDelete,
        TaskType::KbDelete,
        TaskType::KnowledgeListDelete,
        TaskType::DataTableSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ChunkExtract => "chunk:extract",
            TaskType::DocumentProcess => "document:process",
            TaskType::FaqImport => "faq:import",
            TaskType::QuestionGeneration => "question:generation",
            TaskType::SummaryGeneration => "summary:generation",
            TaskType::KbClone => "kb:clone",
            TaskType::IndexDelete => "index:delete",
            TaskType::KbDelete => "kb:delete",
            TaskType::KnowledgeListDelete => "knowledge:list_delete",
            TaskType::DataTableSummary => "datatable:summary",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|task_type| task_type.as_str() == s)
            .ok_or_else(|| AppError::UnroutableTask(format!("unknown task type {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractChunkPayload {
    pub tenant_id: u64,
    pub chunk_id: String,
    #[serde(default)]
    pub model_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentProcessPayload {
    pub request_id: String,
    pub tenant_id: u64,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passages: Vec<String>,
    #[serde(default)]
    pub enable_multimodel: bool,
    #[serde(default)]
    pub enable_question_generation: bool,
    #[serde(default)]
    pub question_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqImportPayload {
    pub tenant_id: u64,
    pub task_id: String,
    pub kb_id: String,
    /// Only required when the import is not a dry run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<FaqEntryPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries_url: Option<String>,
    #[serde(default)]
    pub entry_count: usize,
    #[serde(default)]
    pub mode: ImportMode,
    #[serde(default)]
    pub dry_run: bool,
    /// Milliseconds since the epoch; distinguishes resubmissions under one task id.
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionGenerationPayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub knowledge_id: String,
    pub question_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryGenerationPayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub knowledge_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbClonePayload {
    pub tenant_id: u64,
    pub task_id: String,
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDeletePayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    #[serde(default)]
    pub embedding_model_id: String,
    #[serde(default)]
    pub kb_type: String,
    pub chunk_ids: Vec<String>,
    pub effective_engines: Vec<EffectiveEngine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbDeletePayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub effective_engines: Vec<EffectiveEngine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeListDeletePayload {
    pub tenant_id: u64,
    pub knowledge_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTableSummaryPayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub knowledge_id: String,
}

/// A task's typed payload. The variant decides the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    ChunkExtract(ExtractChunkPayload),
    DocumentProcess(DocumentProcessPayload),
    FaqImport(FaqImportPayload),
    QuestionGeneration(QuestionGenerationPayload),
    SummaryGeneration(SummaryGenerationPayload),
    KbClone(KbClonePayload),
    IndexDelete(IndexDeletePayload),
    KbDelete(KbDeletePayload),
    KnowledgeListDelete(KnowledgeListDeletePayload),
    DataTableSummary(DataTableSummaryPayload),
}

fn decode_as<T: DeserializeOwned>(task_type: TaskType, raw: Value) -> Result<T, AppError> {
    serde_json::from_value(raw)
        .map_err(|err| AppError::Validation(format!("malformed {task_type} payload: {err}")))
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::ChunkExtract(_) => TaskType::ChunkExtract,
            TaskPayload::DocumentProcess(_) => TaskType::DocumentProcess,
            TaskPayload::FaqImport(_) => TaskType::FaqImport,
            TaskPayload::QuestionGeneration(_) => TaskType::QuestionGeneration,
            TaskPayload::SummaryGeneration(_) => TaskType::SummaryGeneration,
            TaskPayload::KbClone(_) => TaskType::KbClone,
            TaskPayload::IndexDelete(_) => TaskType::IndexDelete,
            TaskPayload::KbDelete(_) => TaskType::KbDelete,
            TaskPayload::KnowledgeListDelete(_) => TaskType::KnowledgeListDelete,
            TaskPayload::DataTableSummary(_) => TaskType::DataTableSummary,
        }
    }

    pub fn tenant_id(&self) -> u64 {
        match self {
            TaskPayload::ChunkExtract(p) => p.tenant_id,
            TaskPayload::DocumentProcess(p) => p.tenant_id,
            TaskPayload::FaqImport(p) => p.tenant_id,
            TaskPayload::QuestionGeneration(p) => p.tenant_id,
            TaskPayload::SummaryGeneration(p) => p.tenant_id,
            TaskPayload::KbClone(p) => p.tenant_id,
            TaskPayload::IndexDelete(p) => p.tenant_id,
            TaskPayload::KbDelete(p) => p.tenant_id,
            TaskPayload::KnowledgeListDelete(p) => p.tenant_id,
            TaskPayload::DataTableSummary(p) => p.tenant_id,
        }
    }

    /// Decode a raw payload for the named task type.
    ///
    /// Unknown task types are `UnroutableTask`; payloads that do not match
    /// their type's shape are `Validation` errors.
    pub fn decode(task_type: &str, raw: Value) -> Result<Self, AppError> {
        let task_type: TaskType = task_type.parse()?;
        Ok(match task_type {
            TaskType::ChunkExtract => TaskPayload::ChunkExtract(decode_as(task_type, raw)?),
            TaskType::DocumentProcess => TaskPayload::DocumentProcess(decode_as(task_type, raw)?),
            TaskType::FaqImport => TaskPayload::FaqImport(decode_as(task_type, raw)?),
            TaskType::QuestionGeneration => {
                TaskPayload::QuestionGeneration(decode_as(task_type, raw)?)
            }
            TaskType::SummaryGeneration => {
                TaskPayload::SummaryGeneration(decode_as(task_type, raw)?)
            }
            TaskType::KbClone => TaskPayload::KbClone(decode_as(task_type, raw)?),
            TaskType::IndexDelete => TaskPayload::IndexDelete(decode_as(task_type, raw)?),
            TaskType::KbDelete => TaskPayload::KbDelete(decode_as(task_type, raw)?),
            TaskType::KnowledgeListDelete => {
                TaskPayload::KnowledgeListDelete(decode_as(task_type, raw)?)
            }
            TaskType::DataTableSummary => {
                TaskPayload::DataTableSummary(decode_as(task_type, raw)?)
            }
        })
    }

    pub fn to_value(&self) -> Result<Value, AppError> {
        Ok(match self {
            TaskPayload::ChunkExtract(p) => serde_json::to_value(p)?,
            TaskPayload::DocumentProcess(p) => serde_json::to_value(p)?,
            TaskPayload::FaqImport(p) => serde_json::to_value(p)?,
            TaskPayload::QuestionGeneration(p) => serde_json::to_value(p)?,
            TaskPayload::SummaryGeneration(p) => serde_json::to_value(p)?,
            TaskPayload::KbClone(p) => serde_json::to_value(p)?,
            TaskPayload::IndexDelete(p) => serde_json::to_value(p)?,
            TaskPayload::KbDelete(p) => serde_json::to_value(p)?,
            TaskPayload::KnowledgeListDelete(p) => serde_json::to_value(p)?,
            TaskPayload::DataTableSummary(p) => serde_json::to_value(p)?,
        })
    }

    /// Narrow engine-scoped payloads to the engines that failed last time.
    #[must_use]
    pub fn retry_scope(self, report: &EngineReport) -> Self {
        let failed = report.failed_engines();
        if failed.is_empty() {
            return self;
        }
        match self {
            TaskPayload::IndexDelete(mut p) => {
                p.effective_engines.retain(|engine| failed.contains(engine));
                TaskPayload::IndexDelete(p)
            }
            TaskPayload::KbDelete(mut p) => {
                p.effective_engines.retain(|engine| failed.contains(engine));
                TaskPayload::KbDelete(p)
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct TaskErrorInfo {
    pub code: Option<String>,
    pub message: String,
}

/// The unit carried by the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub task_type: String,
    pub payload: Value,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<TaskErrorInfo>,
}

impl TaskEnvelope {
    pub fn new(payload: &TaskPayload, max_attempts: u32) -> Result<Self, AppError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            task_type: payload.task_type().as_str().to_string(),
            payload: payload.to_value()?,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            enqueued_at: Utc::now(),
            not_before: None,
            last_error: None,
        })
    }

    pub fn decode(&self) -> Result<TaskPayload, AppError> {
        TaskPayload::decode(&self.task_type, self.payload.clone())
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    /// Identifies one claim of this envelope. A retry pushed back under the
    /// same id carries a higher attempt count and so a different lease.
    pub fn lease_id(&self) -> String {
        format!("{}:{}", self.id, self.attempts)
    }
}
