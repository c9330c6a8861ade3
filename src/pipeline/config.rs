//! Pipeline configuration from environment variables

use chrono::Duration;
use std::env;
use thiserror::Error;

/// Configuration rejected by `PipelineConfig::validate`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("STREAM_PROMOTION_THRESHOLD must be at least 1 (got {0})")]
    InvalidPromotionThreshold(u32),

    #[error("STREAM_ALLOWED_GAP_MS must be positive (got {0})")]
    InvalidAllowedGap(u64),

    #[error("MAX_DRAIN_BATCH must be positive")]
    InvalidDrainBatch,
}

/// Configuration for the classification pipeline
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// JSONL file of ingest records (None reads stdin)
    pub input_path: Option<String>,

    /// JSONL file drained events are appended to ("-" logs them instead)
    pub output_path: String,

    /// Maximum inter-arrival gap for two events to count as near-window
    pub allowed_gap_ms: u64,

    /// Consecutive near-window events required to confirm a stream
    pub promotion_threshold: u32,

    /// Drain scheduler cadence in milliseconds
    pub drain_interval_ms: u64,

    /// Maximum events per sink hand-off
    pub max_drain_batch: usize,

    /// Channel buffer size for ingest records
    pub channel_buffer: usize,

    /// Idle horizon after which job lineages are pruned
    pub lineage_ttl_ms: u64,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PROVFLOW_INPUT_PATH` (default: unset, read stdin)
    /// - `PROVFLOW_OUTPUT_PATH` (default: streams/provflow/drained.jsonl)
    /// - `STREAM_ALLOWED_GAP_MS` (default: 3000)
    /// - `STREAM_PROMOTION_THRESHOLD` (default: 3)
    /// - `DRAIN_INTERVAL_MS` (default: 3000)
    /// - `MAX_DRAIN_BATCH` (default: 500)
    /// - `INGEST_CHANNEL_BUFFER` (default: 10000)
    /// - `LINEAGE_TTL_MS` (default: 600000)
    pub fn from_env() -> Self {
        Self {
            input_path: env::var("PROVFLOW_INPUT_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty()),

            output_path: env::var("PROVFLOW_OUTPUT_PATH")
                .unwrap_or_else(|_| "streams/provflow/drained.jsonl".to_string()),

            allowed_gap_ms: env::var("STREAM_ALLOWED_GAP_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3_000),

            promotion_threshold: env::var("STREAM_PROMOTION_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),

            drain_interval_ms: env::var("DRAIN_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3_000),

            max_drain_batch: env::var("MAX_DRAIN_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),

            channel_buffer: env::var("INGEST_CHANNEL_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10_000),

            lineage_ttl_ms: env::var("LINEAGE_TTL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(600_000),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.promotion_threshold == 0 {
            return Err(ConfigError::InvalidPromotionThreshold(self.promotion_threshold));
        }
        if self.allowed_gap_ms == 0 || self.allowed_gap_ms > i64::MAX as u64 {
            return Err(ConfigError::InvalidAllowedGap(self.allowed_gap_ms));
        }
        if self.max_drain_batch == 0 {
            return Err(ConfigError::InvalidDrainBatch);
        }
        Ok(())
    }

    pub fn aggregate_settings(&self) -> AggregateSettings {
        AggregateSettings::new(
            Duration::milliseconds(self.allowed_gap_ms as i64),
            self.promotion_threshold,
        )
    }

    pub fn lineage_ttl(&self) -> Duration {
        Duration::milliseconds(self.lineage_ttl_ms.min(i64::MAX as u64) as i64)
    }
}

/// Per-aggregate classifier settings, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateSettings {
    pub allowed_gap: Duration,
    pub promotion_threshold: u32,
}

impl AggregateSettings {
    pub fn new(allowed_gap: Duration, promotion_threshold: u32) -> Self {
        Self {
            allowed_gap,
            promotion_threshold: promotion_threshold.max(1),
        }
    }
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self::new(Duration::milliseconds(3_000), 3)
    }
}
