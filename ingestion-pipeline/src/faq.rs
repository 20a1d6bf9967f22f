//! FAQ batch import: entry loading, validation, content-hash dedup and
//! result export.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::{
            chunk::{deterministic_id, Chunk, ChunkFlags, ChunkMetadata, ChunkStatus, ChunkType},
            faq::{
                AnswerStrategy, FaqChunkMetadata, FaqEntryPayload, FaqFailedEntry, FaqSuccessEntry,
                ImportMode,
            },
            task::FaqImportPayload,
        },
    },
};
use serde::Serialize;
use tracing::{debug, warn};

pub fn entries_location(task_id: &str) -> String {
    format!("faq_imports/{task_id}/entries.json")
}

pub fn failed_entries_location(task_id: &str) -> String {
    format!("faq_imports/{task_id}/failed_entries.csv")
}

pub fn success_entries_location(task_id: &str) -> String {
    format!("faq_imports/{task_id}/success_entries.csv")
}

pub fn faq_chunk_id(knowledge_id: &str, content_hash: &str) -> String {
    deterministic_id(&[knowledge_id, "faq", content_hash])
}

/// Entries carried inline, or the offloaded list behind `entries_url`.
pub async fn load_entries(
    storage: &StorageManager,
    payload: &FaqImportPayload,
) -> Result<Vec<FaqEntryPayload>, AppError> {
    if !payload.entries.is_empty() {
        return Ok(payload.entries.clone());
    }
    let Some(location) = payload.entries_url.as_deref() else {
        return Err(AppError::Validation("faq import carries no entries".into()));
    };

    let entries: Vec<FaqEntryPayload> = storage.get_json(location).await?;
    if payload.entry_count != 0 && payload.entry_count != entries.len() {
        warn!(
            task_id = %payload.task_id,
            expected = payload.entry_count,
            found = entries.len(),
            "stored faq entry count differs from payload"
        );
    }
    debug!(task_id = %payload.task_id, %location, entries = entries.len(), "faq entries loaded");
    Ok(entries)
}

/// An entry that passed validation, with its normalized metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEntry {
    pub index: usize,
    pub entry: FaqEntryPayload,
    pub metadata: FaqChunkMetadata,
    pub content_hash: String,
}

impl ValidatedEntry {
    fn new(index: usize, entry: &FaqEntryPayload, metadata: FaqChunkMetadata) -> Self {
        let content_hash = metadata.content_hash();
        Self {
            index,
            entry: entry.clone(),
            metadata,
            content_hash,
        }
    }
}

/// Metadata for an entry an earlier delivery already accepted.
fn trusted_metadata(entry: &FaqEntryPayload) -> FaqChunkMetadata {
    FaqChunkMetadata {
        standard_question: entry.standard_question.clone(),
        similar_questions: entry.similar_questions.clone(),
        negative_questions: entry.negative_questions.clone(),
        answers: entry.answers.clone(),
        answer_strategy: entry
            .answer_strategy
            .as_deref()
            .and_then(|raw| raw.parse::<AnswerStrategy>().ok())
            .unwrap_or_default(),
        version: 1,
        source: None,
    }
    .normalized()
}

/// Split entries into accepted and rejected. Indices in `trusted` were
/// accepted by an earlier delivery of the same import and are not checked again.
pub fn validate_entries(
    entries: &[FaqEntryPayload],
    trusted: &HashSet<usize>,
) -> (Vec<ValidatedEntry>, Vec<FaqFailedEntry>) {
    let mut valid = Vec::new();
    let mut failed = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if trusted.contains(&index) {
            valid.push(ValidatedEntry::new(index, entry, trusted_metadata(entry)));
            continue;
        }
        match entry.validate() {
            Ok(metadata) => valid.push(ValidatedEntry::new(index, entry, metadata)),
            Err(reason) => failed.push(FaqFailedEntry::rejected(index, entry, reason)),
        }
    }
    (valid, failed)
}

/// What an import will do to the knowledge item's FAQ chunks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImportPlan {
    pub writes: Vec<ValidatedEntry>,
    /// Batch indices skipped as duplicates.
    pub skipped: Vec<usize>,
    /// Existing chunk ids a replace import removes.
    pub removals: Vec<String>,
}

/// Decide which entries to write.
///
/// `existing` maps content hash to the live FAQ chunk carrying it. Chunks whose
/// metadata `source` is `task_id` were written by an earlier delivery of this
/// import and are rewritten rather than treated as duplicates.
pub fn plan_import(
    mode: ImportMode,
    task_id: &str,
    entries: Vec<ValidatedEntry>,
    existing: &HashMap<String, Chunk>,
) -> ImportPlan {
    let mut plan = ImportPlan::default();
    let mut batch_hashes = HashSet::new();

    for entry in entries {
        if !batch_hashes.insert(entry.content_hash.clone()) {
            plan.skipped.push(entry.index);
            continue;
        }
        let duplicate = mode == ImportMode::Append
            && existing.get(&entry.content_hash).is_some_and(|chunk| {
                chunk
                    .faq_metadata()
                    .and_then(|meta| meta.source.as_deref())
                    != Some(task_id)
            });
        if duplicate {
            plan.skipped.push(entry.index);
        } else {
            plan.writes.push(entry);
        }
    }

    if mode == ImportMode::Replace {
        plan.removals = existing
            .iter()
            .filter(|(hash, _)| !batch_hashes.contains(*hash))
            .map(|(_, chunk)| chunk.id.clone())
            .collect();
        plan.removals.sort();
    }
    plan
}

/// Ownership of the FAQ chunks an import writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaqTarget<'a> {
    pub tenant_id: u64,
    pub knowledge_base_id: &'a str,
    pub knowledge_id: &'a str,
    pub task_id: &'a str,
}

pub fn faq_chunk(target: &FaqTarget<'_>, validated: &ValidatedEntry) -> Chunk {
    let mut metadata = validated.metadata.clone();
    metadata.source = Some(target.task_id.to_string());

    let mut lines = vec![metadata.standard_question.clone()];
    lines.extend(metadata.similar_questions.iter().cloned());
    let mut chunk = Chunk::new(
        faq_chunk_id(target.knowledge_id, &validated.content_hash),
        target.tenant_id,
        target.knowledge_base_id,
        target.knowledge_id,
        ChunkType::Faq,
        lines.join("\n"),
    );

    let entry = &validated.entry;
    if let Some(seq_id) = entry.id.filter(|id| *id > 0) {
        chunk.seq_id = seq_id;
    }
    chunk.chunk_index = validated.index;
    chunk.tag_id = entry.tag_id.map(|id| id.to_string());
    chunk.is_enabled = entry.is_enabled.unwrap_or(true);
    chunk.flags = if entry.is_recommended.unwrap_or(true) {
        ChunkFlags::NONE.set(ChunkFlags::RECOMMENDED)
    } else {
        ChunkFlags::NONE
    };
    chunk.content_hash = Some(validated.content_hash.clone());
    chunk.metadata = Some(ChunkMetadata::Faq(metadata));
    chunk.advance_status(ChunkStatus::Stored);
    chunk
}

#[derive(Serialize)]
struct FailedRow<'a> {
    index: usize,
    reason: &'a str,
    standard_question: &'a str,
    tag_name: Option<&'a str>,
    similar_questions: String,
    negative_questions: String,
    answers: String,
    answer_all: bool,
    is_disabled: bool,
}

/// List cells hold one item per line.
fn list_cell(items: &[String]) -> String {
    items.join("\n")
}

#[derive(Serialize)]
struct SuccessRow<'a> {
    index: usize,
    seq_id: i64,
    tag_id: Option<i64>,
    tag_name: Option<&'a str>,
    standard_question: &'a str,
}

fn to_csv<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<Bytes, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let data = writer
        .into_inner()
        .map_err(|err| AppError::Io(err.into_error()))?;
    Ok(Bytes::from(data))
}

pub fn failed_entries_csv(entries: &[FaqFailedEntry]) -> Result<Bytes, AppError> {
    to_csv(entries.iter().map(|e| FailedRow {
        index: e.index,
        reason: &e.reason,
        standard_question: &e.standard_question,
        tag_name: e.tag_name.as_deref(),
        similar_questions: list_cell(&e.similar_questions),
        negative_questions: list_cell(&e.negative_questions),
        answers: list_cell(&e.answers),
        answer_all: e.answer_all,
        is_disabled: e.is_disabled,
    }))
}

pub fn success_entries_csv(entries: &[FaqSuccessEntry]) -> Result<Bytes, AppError> {
    to_csv(entries.iter().map(|e| SuccessRow {
        index: e.index,
        seq_id: e.seq_id,
        tag_id: e.tag_id,
        tag_name: e.tag_name.as_deref(),
        standard_question: &e.standard_question,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(question: &str, answers: &[&str]) -> FaqEntryPayload {
        FaqEntryPayload {
            standard_question: question.into(),
            answers: answers.iter().map(|a| (*a).to_string()).collect(),
            ..Default::default()
        }
    }

    fn target() -> FaqTarget<'static> {
        FaqTarget {
            tenant_id: 1,
            knowledge_base_id: "kb-1",
            knowledge_id: "faq-k",
            task_id: "import-1",
        }
    }

    #[test]
    fn validation_reports_reasons_by_index() {
        let entries = vec![
            entry("Q1", &["A1"]),
            entry("  ", &["A2"]),
            entry("Q3", &[]),
            FaqEntryPayload {
                answer_strategy: Some("sometimes".into()),
                ..entry("Q4", &["A4"])
            },
        ];
        let (valid, failed) = validate_entries(&entries, &HashSet::new());

        assert_eq!(valid.len(), 1);
        let reasons: Vec<(usize, &str)> = failed
            .iter()
            .map(|f| (f.index, f.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (1, "standard question required"),
                (2, "answers required"),
                (3, "invalid answer strategy: sometimes"),
            ]
        );
    }

    #[test]
    fn trusted_indices_skip_validation() {
        let entries = vec![entry("Q1", &[])];
        let trusted = HashSet::from([0]);
        let (valid, failed) = validate_entries(&entries, &trusted);
        assert_eq!(valid.len(), 1);
        assert!(failed.is_empty());
    }

    #[test]
    fn append_skips_existing_and_repeated_hashes() {
        let entries = vec![
            entry("Q1", &["A1"]),
            entry("Q2", &["A2"]),
            entry(" Q2 ", &["A2 "]),
        ];
        let (valid, _) = validate_entries(&entries, &HashSet::new());

        let mut existing_chunk = faq_chunk(
            &FaqTarget {
                task_id: "older-import",
                ..target()
            },
            &valid[0],
        );
        existing_chunk.id = "existing".into();
        let existing = HashMap::from([(valid[0].content_hash.clone(), existing_chunk)]);

        let plan = plan_import(ImportMode::Append, "import-1", valid, &existing);
        assert_eq!(plan.writes.iter().map(|w| w.index).collect::<Vec<_>>(), vec![1]);
        assert_eq!(plan.skipped, vec![0, 2]);
        assert!(plan.removals.is_empty());
    }

    #[test]
    fn append_rewrites_chunks_from_the_same_import() {
        let (valid, _) = validate_entries(&[entry("Q1", &["A1"])], &HashSet::new());
        let mine = faq_chunk(&target(), &valid[0]);
        let existing = HashMap::from([(valid[0].content_hash.clone(), mine)]);

        let plan = plan_import(ImportMode::Append, "import-1", valid, &existing);
        assert_eq!(plan.writes.len(), 1);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn replace_removes_entries_missing_from_the_batch() {
        let (old, _) = validate_entries(
            &[entry("Old", &["gone"]), entry("Kept", &["still here"])],
            &HashSet::new(),
        );
        let existing: HashMap<String, Chunk> = old
            .iter()
            .map(|v| (v.content_hash.clone(), faq_chunk(&target(), v)))
            .collect();
        let (fresh, _) = validate_entries(
            &[entry("Kept", &["still here"]), entry("New", &["added"])],
            &HashSet::new(),
        );

        let plan = plan_import(ImportMode::Replace, "import-2", fresh, &existing);
        assert_eq!(plan.writes.len(), 2);
        assert_eq!(plan.removals, vec![faq_chunk_id("faq-k", &old[0].content_hash)]);
    }

    #[test]
    fn faq_chunk_carries_entry_attributes() {
        let (valid, _) = validate_entries(
            &[FaqEntryPayload {
                id: Some(42),
                similar_questions: vec!["How to reset?".into()],
                tag_id: Some(7),
                is_enabled: Some(false),
                is_recommended: Some(false),
                ..entry("Reset password", &["Use the link"])
            }],
            &HashSet::new(),
        );
        let chunk = faq_chunk(&target(), &valid[0]);

        assert_eq!(chunk.id, faq_chunk_id("faq-k", &valid[0].content_hash));
        assert_eq!(chunk.seq_id, 42);
        assert_eq!(chunk.tag_id.as_deref(), Some("7"));
        assert!(!chunk.is_enabled);
        assert!(!chunk.flags.has(ChunkFlags::RECOMMENDED));
        assert_eq!(chunk.content, "Reset password\nHow to reset?");
        assert_eq!(chunk.content_hash.as_deref(), Some(valid[0].content_hash.as_str()));
        assert_eq!(
            chunk.faq_metadata().and_then(|m| m.source.as_deref()),
            Some("import-1")
        );
        chunk.validate_metadata().expect("faq metadata on faq chunk");
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let rows = vec![FaqFailedEntry {
            index: 2,
            reason: "answers required".into(),
            standard_question: "Q3".into(),
            similar_questions: vec!["Q3b".into()],
            answer_all: true,
            ..Default::default()
        }];
        let csv = failed_entries_csv(&rows).expect("csv");
        let text = String::from_utf8(csv.to_vec()).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some(
                "index,reason,standard_question,tag_name,similar_questions,\
                 negative_questions,answers,answer_all,is_disabled"
            )
        );
        assert_eq!(lines.next(), Some("2,answers required,Q3,,Q3b,,,true,false"));
    }

    #[test]
    fn rejected_entries_keep_their_submitted_fields() {
        let entries = vec![FaqEntryPayload {
            standard_question: "  Reset password ".into(),
            similar_questions: vec!["How to reset?".into()],
            negative_questions: vec!["Reset router".into()],
            answer_strategy: Some("random".into()),
            tag_name: Some("account".into()),
            is_enabled: Some(false),
            ..Default::default()
        }];
        let (valid, failed) = validate_entries(&entries, &HashSet::new());

        assert!(valid.is_empty());
        assert_eq!(
            failed,
            vec![FaqFailedEntry {
                index: 0,
                reason: "answers required".into(),
                standard_question: "Reset password".into(),
                tag_name: Some("account".into()),
                similar_questions: vec!["How to reset?".into()],
                negative_questions: vec!["Reset router".into()],
                answers: Vec::new(),
                answer_all: false,
                is_disabled: true,
            }]
        );
    }
}
