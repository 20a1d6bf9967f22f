mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};
pub use stages::STAGE_COUNT;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::types::{engine::EngineReport, task::DocumentProcessPayload},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{progress::ProgressTracker, reader::ReadConfig, services::IngestionServices};

use self::{
    context::PipelineContext,
    stages::{chunk, index, parse, persist},
    state::ready,
};

/// What one document run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub chunk_count: usize,
    pub replaced_chunk_ids: Vec<String>,
    pub report: EngineReport,
    pub followup_task_ids: Vec<String>,
}

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self::new_with_config(services, IngestionConfig::default())
    }

    pub fn new_with_config(
        services: Arc<IngestionServices>,
        pipeline_config: IngestionConfig,
    ) -> Self {
        Self::with_services(
            pipeline_config,
            Arc::new(DefaultPipelineServices::new(services)),
        )
    }

    pub fn with_services(
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            pipeline_config,
            services,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.pipeline_config
    }

    /// Delay before the next attempt of a failed task.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        retry_delay(&self.pipeline_config.tuning, attempt)
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Parse, chunk, persist and index one document, then schedule its
    /// follow-up tasks. The tracker must already be started.
    #[tracing::instrument(
        skip_all,
        fields(task_id = %task_id, attempt, knowledge_id = %payload.knowledge_id)
    )]
    pub async fn process(
        &self,
        task_id: &str,
        attempt: u32,
        payload: &DocumentProcessPayload,
        read_config: ReadConfig,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<DocumentOutcome, AppError> {
        tracker.set_total(STAGE_COUNT);
        let mut ctx = PipelineContext::new(
            task_id,
            attempt,
            payload,
            read_config,
            &self.pipeline_config,
            self.services.as_ref(),
            tracker,
            cancel,
        );

        let machine = ready();
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let machine = parse(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let parse_ms = Self::duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let machine = chunk(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let chunk_ms = Self::duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let machine = persist(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let persist_ms = Self::duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let _machine = index(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let index_ms = Self::duration_millis(stage_start.elapsed());

        let followup_task_ids = if self.pipeline_config.chunk_only {
            Vec::new()
        } else {
            self.services
                .schedule_followups(payload)
                .await
                .map_err(|err| ctx.abort(err))?
        };

        info!(
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            parse_ms,
            chunk_ms,
            persist_ms,
            index_ms,
            chunks = ctx.chunks.len(),
            "document pipeline finished"
        );

        Ok(DocumentOutcome {
            chunk_count: ctx.chunks.len(),
            replaced_chunk_ids: std::mem::take(&mut ctx.stale_chunk_ids),
            report: std::mem::take(&mut ctx.report),
            followup_task_ids,
        })
    }
}

/// `base * 2^(attempt - 1)` with a capped exponent, never above the max delay.
pub fn retry_delay(tuning: &IngestionTuning, attempt: u32) -> Duration {
    let capped_attempt = attempt
        .saturating_sub(1)
        .min(tuning.retry_backoff_cap_exponent);
    let multiplier = 2_u64.pow(capped_attempt);
    let delay = tuning.retry_base_delay_secs.saturating_mul(multiplier);

    Duration::from_secs(delay.min(tuning.retry_max_delay_secs))
}
