//! Pipeline ingestion - async channel processor for provenance events
//!
//! Main loop:
//! 1. Receives ingest records from the event source via mpsc channel
//! 2. Tracks each record's job lineage, then routes it through the registry
//! 3. Periodically logs throughput and channel health
//! 4. Performs a final drain when the channel closes
//!
//! Draining on a cadence is the scheduler's job; ingestion never blocks on
//! the sink except for the final drain.

use super::aggregate::EventRejected;
use super::classifier::Classification;
use super::registry::AggregateRegistry;
use super::scheduler::run_final_drain;
use super::sink::EventSink;
use super::stats::EventStatsDelta;
use super::types::ProvenanceEvent;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// One line of ingest input: an event plus the statistics it contributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub event: ProvenanceEvent,

    #[serde(default)]
    pub stats: EventStatsDelta,
}

impl IngestRecord {
    pub fn new(event: ProvenanceEvent) -> Self {
        Self {
            event,
            stats: EventStatsDelta::default(),
        }
    }
}

/// Totals reported when ingestion stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionSummary {
    pub accepted: u64,
    pub rejected: u64,
    pub stream: u64,
    pub batch: u64,
    pub final_drain_delivered: usize,
}

/// Track the record's lineage and classify it
///
/// Records without a job id or event time skip lineage tracking and are
/// rejected by the aggregate.
pub fn ingest_record(
    registry: &AggregateRegistry,
    record: IngestRecord,
) -> Result<Classification, EventRejected> {
    if record.event.event_time.is_some() && !record.event.job_id.is_empty() {
        registry.lineages().track(&record.event.job_id, Utc::now());
    }
    registry.add_event(record.event, &record.stats)
}

/// Start pipeline ingestion from the ingest record channel
///
/// Arguments:
/// - `rx`: Receiver end of the ingest record channel
/// - `registry`: Shared aggregate registry
/// - `sink`: Sink used for the final drain on shutdown
/// - `max_drain_batch`: Maximum events per sink call during the final drain
/// - `channel_capacity`: Channel size, used for pressure warnings
///
/// This function runs until the channel is closed (event source shutdown).
pub async fn start_pipeline_ingestion(
    mut rx: mpsc::Receiver<IngestRecord>,
    registry: Arc<AggregateRegistry>,
    sink: Arc<dyn EventSink>,
    max_drain_batch: usize,
    channel_capacity: usize,
) -> IngestionSummary {
    log::info!("🚀 Starting pipeline ingestion");
    log::info!("   ├─ Sink: {}", sink.sink_type());
    log::info!("   └─ Waiting for events...");

    let mut summary = IngestionSummary::default();
    let mut health_timer = interval(Duration::from_secs(10));
    let mut window_count = 0u64;
    let mut last_log_time = std::time::Instant::now();
    let channel_capacity = channel_capacity.max(1);

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else {
                    log::warn!("⚠️  Ingest channel closed, stopping ingestion");
                    break;
                };

                let event_id = record.event.event_id;
                match ingest_record(&registry, record) {
                    Ok(outcome) => {
                        summary.accepted += 1;
                        match outcome {
                            Classification::Stream => summary.stream += 1,
                            Classification::Batch => summary.batch += 1,
                            Classification::Provisional | Classification::Ignored => {}
                        }
                    }
                    Err(e) => {
                        summary.rejected += 1;
                        log::warn!("⚠️  Rejected event {}: {}", event_id, e);
                    }
                }
                window_count += 1;
            }

            _ = health_timer.tick() => {
                let elapsed = last_log_time.elapsed().as_secs_f64();
                if window_count > 0 && elapsed > 0.0 {
                    log::info!(
                        "📊 Ingestion rate: {:.1} events/sec (total: {}, rejected: {}, aggregates: {})",
                        window_count as f64 / elapsed,
                        summary.accepted + summary.rejected,
                        summary.rejected,
                        registry.len()
                    );
                }
                last_log_time = std::time::Instant::now();
                window_count = 0;

                // Warn if channel is filling up (> 50% capacity)
                let channel_usage = rx.len();
                if channel_usage > channel_capacity / 2 {
                    log::warn!(
                        "⚠️  Channel usage high: {}/{} ({}%)",
                        channel_usage,
                        channel_capacity,
                        (channel_usage * 100) / channel_capacity
                    );
                }
            }
        }
    }

    log::info!("🔄 Performing final drain...");
    let drained = run_final_drain(&registry, sink.as_ref(), max_drain_batch).await;
    summary.final_drain_delivered = drained.delivered;

    log::info!(
        "✅ Pipeline ingestion stopped: {} accepted, {} rejected, {} delivered on final drain",
        summary.accepted,
        summary.rejected,
        summary.final_drain_delivered
    );
    summary
}
