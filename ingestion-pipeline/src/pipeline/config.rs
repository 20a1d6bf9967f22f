#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
    pub idle_backoff_ms: u64,
    pub error_backoff_ms: u64,
    pub summary_chunk_limit: usize,
    pub summary_max_chars: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 15 * 60,
            retry_backoff_cap_exponent: 5,
            idle_backoff_ms: 500,
            error_backoff_ms: 1_000,
            summary_chunk_limit: 8,
            summary_max_chars: 6_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Persist chunks without indexing them or scheduling follow-up tasks.
    pub chunk_only: bool,
}
