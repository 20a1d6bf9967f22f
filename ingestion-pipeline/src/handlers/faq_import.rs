use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkType},
        faq::{FaqFailedEntry, FaqSuccessEntry, ImportMode},
        task::{FaqImportPayload, TaskPayload, TaskType},
    },
};
use tracing::{debug, info};

use crate::{
    catalog::{TaskHandler, TaskRun},
    engines::into_result,
    faq::{
        failed_entries_csv, failed_entries_location, faq_chunk, load_entries, plan_import,
        success_entries_csv, success_entries_location, validate_entries, FaqTarget,
        ValidatedEntry,
    },
    progress::ProgressTracker,
    services::IngestionServices,
};

use super::{begin, misrouted, settle};

/// Imports a batch of FAQ entries into one knowledge item. Entry-level
/// problems are reported per entry and never fail the task.
pub struct FaqImportHandler {
    services: Arc<IngestionServices>,
}

struct ImportTotals {
    success: Vec<FaqSuccessEntry>,
    failed: Vec<FaqFailedEntry>,
    skipped: usize,
}

fn success_entry(validated: &ValidatedEntry, seq_id: i64) -> FaqSuccessEntry {
    FaqSuccessEntry {
        index: validated.index,
        seq_id,
        tag_id: validated.entry.tag_id,
        tag_name: validated.entry.tag_name.clone(),
        standard_question: validated.metadata.standard_question.clone(),
    }
}

impl FaqImportHandler {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self { services }
    }

    /// Live FAQ chunks of the knowledge item keyed by content hash.
    async fn existing_by_hash(
        &self,
        mode: ImportMode,
        knowledge_id: &str,
        entries: &[ValidatedEntry],
    ) -> Result<HashMap<String, Chunk>, AppError> {
        let store = self.services.chunks.as_ref();
        let mut existing = HashMap::new();
        match mode {
            ImportMode::Append => {
                for entry in entries {
                    if existing.contains_key(&entry.content_hash) {
                        continue;
                    }
                    if let Some(chunk) = store.find_by_content_hash(knowledge_id, &entry.content_hash).await? {
                        existing.insert(entry.content_hash.clone(), chunk);
                    }
                }
            }
            ImportMode::Replace => {
                for chunk in store.list_by_knowledge(knowledge_id).await? {
                    if chunk.chunk_type != ChunkType::Faq {
                        continue;
                    }
                    if let Some(hash) = chunk.content_hash.clone() {
                        existing.entry(hash).or_insert(chunk);
                    }
                }
            }
        }
        Ok(existing)
    }

    async fn remove(&self, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.services.chunks.soft_delete(ids).await?;
        let engines = self.services.engines.defaults().to_vec();
        into_result(self.services.engines.delete_by_chunk_ids(&engines, ids).await)?;
        debug!(removed = ids.len(), "replaced faq entries removed");
        Ok(())
    }

    /// Write planned entries in batches, reporting progress after each one.
    async fn write(
        &self,
        payload: &FaqImportPayload,
        knowledge_id: &str,
        writes: Vec<ValidatedEntry>,
        total: usize,
        tracker: &mut ProgressTracker,
    ) -> Result<Vec<FaqSuccessEntry>, AppError> {
        let target = FaqTarget {
            tenant_id: payload.tenant_id,
            knowledge_base_id: &payload.kb_id,
            knowledge_id,
            task_id: &payload.task_id,
        };
        let batch_size = self.services.config.faq_batch_size.max(1);
        let mut success = Vec::with_capacity(writes.len());

        for batch in writes.chunks(batch_size) {
            let chunks: Vec<Chunk> = batch.iter().map(|v| faq_chunk(&target, v)).collect();
            let stored = self.services.chunks.upsert_many(chunks).await?;
            let (indexed, _) = self.services.index_chunks(stored).await?;
            success.extend(
                batch
                    .iter()
                    .zip(&indexed)
                    .map(|(validated, chunk)| success_entry(validated, chunk.seq_id)),
            );

            // Entries before the last written index are settled one way or another.
            let processed = batch.last().map_or(0, |v| v.index + 1).min(total);
            tracker
                .advance(processed, format!("imported {} entries", success.len()))
                .await?;
        }
        Ok(success)
    }

    async fn import(
        &self,
        payload: &FaqImportPayload,
        tracker: &mut ProgressTracker,
    ) -> Result<String, AppError> {
        let knowledge_id = payload
            .knowledge_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if knowledge_id.is_none() && !payload.dry_run {
            return Err(AppError::Validation(
                "knowledge_id is required unless dry_run is set".into(),
            ));
        }

        let entries = load_entries(&self.services.storage, payload).await?;
        let total = entries.len();
        tracker.set_total(total);

        let trusted: HashSet<usize> = tracker.record().valid_entry_indices.iter().copied().collect();
        if !trusted.is_empty() {
            debug!(task_id = %payload.task_id, trusted = trusted.len(), "resuming faq import");
        }
        let (valid, failed) = validate_entries(&entries, &trusted);
        let valid_indices: Vec<usize> = valid.iter().map(|v| v.index).collect();
        tracker.annotate(|record| {
            record.valid_entry_indices = valid_indices;
            record.failed_count = failed.len();
        });
        tracker.save().await?;

        let totals = match knowledge_id {
            Some(knowledge_id) if !payload.dry_run => {
                let existing = self.existing_by_hash(payload.mode, knowledge_id, &valid).await?;
                let plan = plan_import(payload.mode, &payload.task_id, valid, &existing);
                self.remove(&plan.removals).await?;
                let success = self
                    .write(payload, knowledge_id, plan.writes, total, tracker)
                    .await?;
                ImportTotals {
                    success,
                    failed,
                    skipped: plan.skipped.len(),
                }
            }
            _ => ImportTotals {
                success: valid.iter().map(|v| success_entry(v, 0)).collect(),
                failed,
                skipped: 0,
            },
        };

        self.record_results(payload, &totals, tracker).await?;
        tracker
            .advance(total, format!("processed {total} entries"))
            .await?;

        info!(
            task_id = %payload.task_id,
            mode = %payload.mode,
            dry_run = payload.dry_run,
            success = totals.success.len(),
            failed = totals.failed.len(),
            skipped = totals.skipped,
            "faq import finished"
        );
        let verb = if payload.dry_run { "validated" } else { "imported" };
        Ok(format!(
            "{verb} {} entries, {} failed, {} skipped",
            totals.success.len(),
            totals.failed.len(),
            totals.skipped
        ))
    }

    /// Attach counts and detail lists. Lists above the inline limit go to
    /// object storage as CSV.
    async fn record_results(
        &self,
        payload: &FaqImportPayload,
        totals: &ImportTotals,
        tracker: &mut ProgressTracker,
    ) -> Result<(), AppError> {
        let limit = self.services.config.faq_inline_result_limit;
        let storage = &self.services.storage;

        let failed_url = if totals.failed.len() > limit {
            let location = failed_entries_location(&payload.task_id);
            storage.put(&location, failed_entries_csv(&totals.failed)?).await?;
            Some(location)
        } else {
            None
        };
        let success_url = if totals.success.len() > limit {
            let location = success_entries_location(&payload.task_id);
            storage.put(&location, success_entries_csv(&totals.success)?).await?;
            Some(location)
        } else {
            None
        };

        tracker.annotate(|record| {
            record.success_count = totals.success.len();
            record.failed_count = totals.failed.len();
            record.skipped_count = totals.skipped;
            record.failed_entries = if failed_url.is_some() {
                Vec::new()
            } else {
                totals.failed.clone()
            };
            record.success_entries = if success_url.is_some() {
                Vec::new()
            } else {
                totals.success.clone()
            };
            record.failed_entries_url = failed_url;
            record.success_entries_url = success_url;
        });
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for FaqImportHandler {
    fn task_type(&self) -> TaskType {
        TaskType::FaqImport
    }

    #[tracing::instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn handle(&self, run: &TaskRun, payload: TaskPayload) -> Result<(), AppError> {
        let TaskPayload::FaqImport(mut payload) = payload else {
            return Err(misrouted(TaskType::FaqImport, &payload));
        };
        // Storage locations and chunk sources key off the task id.
        if payload.task_id.trim().is_empty() {
            payload.task_id.clone_from(&run.id);
        }
        let progress_id = payload.task_id.clone();

        // A new submission under the same task id starts over.
        let mut tracker = begin(&self.services, run, TaskType::FaqImport, &progress_id, |record| {
            record.enqueued_at == Some(payload.enqueued_at)
        })
        .await?;
        tracker.annotate(|record| {
            record.import_mode = Some(payload.mode);
            record.dry_run = payload.dry_run;
            record.enqueued_at = Some(payload.enqueued_at);
            record.knowledge_base_id = Some(payload.kb_id.clone());
            record.knowledge_id.clone_from(&payload.knowledge_id);
        });
        let outcome = self.import(&payload, &mut tracker).await;
        settle(tracker, outcome).await
    }
}
