use common::error::AppError;
use state_machines::core::GuardError;
use tracing::{debug, instrument};

use crate::{
    cancellation::ensure_active,
    graph::{build_document_chunks, ChunkOwner},
};

use super::{
    context::PipelineContext,
    state::{Chunked, DocumentMachine, Indexed, Parsed, Persisted, Ready},
};

/// Checkpoints reported while a document moves through the stages.
pub const STAGE_COUNT: usize = 4;

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, knowledge_id = %ctx.payload.knowledge_id)
)]
pub async fn parse(
    machine: DocumentMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Parsed>, AppError> {
    ensure_active(ctx.cancel, &ctx.task_id)?;
    let document = ctx
        .services
        .load_document(ctx.payload, &ctx.read_config)
        .await?;

    let text_chars: usize = document
        .chunks
        .iter()
        .map(|chunk| chunk.content.chars().count())
        .sum();
    tracing::info!(
        task_id = %ctx.task_id,
        attempt = ctx.attempt,
        title = %document.title,
        parsed_chunks = document.chunks.len(),
        text_chars,
        "document input ready"
    );

    ctx.document = Some(document);
    ctx.checkpoint(1, "document parsed").await?;

    machine
        .parse()
        .map_err(|(_, guard)| map_guard_error("parse", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, knowledge_id = %ctx.payload.knowledge_id)
)]
pub async fn chunk(
    machine: DocumentMachine<(), Parsed>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Chunked>, AppError> {
    ensure_active(ctx.cancel, &ctx.task_id)?;
    let document = ctx.take_document()?;
    if document.chunks.is_empty() {
        return Err(AppError::Validation(format!(
            "document {} produced no content",
            ctx.payload.knowledge_id
        )));
    }

    let owner = ChunkOwner {
        tenant_id: ctx.payload.tenant_id,
        knowledge_base_id: ctx.payload.knowledge_base_id.clone(),
        knowledge_id: ctx.payload.knowledge_id.clone(),
    };
    ctx.chunks = build_document_chunks(&owner, &document, ctx.read_config.enable_multimodal);

    debug!(
        task_id = %ctx.task_id,
        attempt = ctx.attempt,
        chunk_count = ctx.chunks.len(),
        "document chunk graph built"
    );
    ctx.checkpoint(2, "chunks built").await?;

    machine
        .chunk()
        .map_err(|(_, guard)| map_guard_error("chunk", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, knowledge_id = %ctx.payload.knowledge_id)
)]
pub async fn persist(
    machine: DocumentMachine<(), Chunked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Persisted>, AppError> {
    ensure_active(ctx.cancel, &ctx.task_id)?;
    let chunks = std::mem::take(&mut ctx.chunks);
    let (stored, stale) = ctx
        .services
        .store_chunks(&ctx.payload.knowledge_id, chunks)
        .await?;

    debug!(
        task_id = %ctx.task_id,
        attempt = ctx.attempt,
        stored = stored.len(),
        replaced = stale.len(),
        "document chunks persisted"
    );
    ctx.chunks = stored;
    ctx.stale_chunk_ids = stale;
    ctx.checkpoint(3, "chunks stored").await?;

    machine
        .persist()
        .map_err(|(_, guard)| map_guard_error("persist", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, attempt = ctx.attempt, knowledge_id = %ctx.payload.knowledge_id)
)]
pub async fn index(
    machine: DocumentMachine<(), Persisted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Indexed>, AppError> {
    if !ctx.pipeline_config.chunk_only {
        ensure_active(ctx.cancel, &ctx.task_id)?;
        let chunks = std::mem::take(&mut ctx.chunks);
        let (indexed, report) = ctx.services.index_chunks(chunks).await?;
        debug!(
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            indexed = indexed.len(),
            engines = report.succeeded.len(),
            "document chunks indexed"
        );
        ctx.chunks = indexed;
        ctx.report = report;
    }
    ctx.checkpoint(STAGE_COUNT, "chunks indexed").await?;

    machine
        .index()
        .map_err(|(_, guard)| map_guard_error("index", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid document pipeline transition during {event}: {guard:?}"
    ))
}
