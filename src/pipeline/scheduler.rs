//! Drain scheduler - periodically drain every aggregate into the sink
//!
//! The core only exposes `drain`; this task owns the cadence. Each cycle:
//! 1. Drains all aggregates (each under its own fair lock, no I/O inside)
//! 2. Hands delivered events to the sink in bounded chunks
//! 3. Prunes job lineages that have gone idle

use super::aggregate::DrainReport;
use super::registry::AggregateRegistry;
use super::sink::EventSink;
use super::types::AggregateKey;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Totals for one drain cycle across all aggregates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainCycleSummary {
    pub aggregates: usize,
    pub delivered: usize,
    pub streamed: usize,
    pub reconciled: usize,
    pub timed_out: usize,
    pub sink_batches: usize,
    pub failed_batches: usize,
}

/// Drain every aggregate once and deliver the results
///
/// Sink failures are logged per batch and do not stop the cycle.
pub async fn run_drain_cycle(
    registry: &AggregateRegistry,
    sink: &dyn EventSink,
    max_batch: usize,
) -> DrainCycleSummary {
    deliver_reports(registry.drain_all(), sink, max_batch).await
}

/// Shutdown drain: like `run_drain_cycle`, but provisional events still
/// inside their window are flushed to batch and delivered too.
pub async fn run_final_drain(
    registry: &AggregateRegistry,
    sink: &dyn EventSink,
    max_batch: usize,
) -> DrainCycleSummary {
    deliver_reports(registry.drain_all_final(), sink, max_batch).await
}

async fn deliver_reports(
    reports: Vec<(AggregateKey, DrainReport)>,
    sink: &dyn EventSink,
    max_batch: usize,
) -> DrainCycleSummary {
    let mut summary = DrainCycleSummary::default();
    let max_batch = max_batch.max(1);

    for (key, report) in reports {
        summary.aggregates += 1;
        summary.delivered += report.delivered.len();
        summary.streamed += report.streamed.len();
        summary.reconciled += report.reconciled;
        summary.timed_out += report.timed_out;

        if !report.stats.is_empty() {
            log::debug!(
                "{} stats: {} events, {} jobs finished, {} bytes in, {} bytes out",
                key,
                report.stats.total_count,
                report.stats.jobs_finished,
                report.stats.bytes_in,
                report.stats.bytes_out
            );
        }

        for chunk in report.delivered.chunks(max_batch) {
            summary.sink_batches += 1;
            if let Err(e) = sink.deliver(&key, chunk).await {
                summary.failed_batches += 1;
                log::error!(
                    "❌ {} sink failed to deliver {} events for {}: {}",
                    sink.sink_type(),
                    chunk.len(),
                    key,
                    e
                );
            }
        }
    }

    if summary.aggregates > 0 {
        log::info!(
            "📊 Drain complete: {} aggregates, {} delivered ({} reconciled, {} timed out), {} stream",
            summary.aggregates,
            summary.delivered,
            summary.reconciled,
            summary.timed_out,
            summary.streamed
        );
    }

    summary
}

/// Drain scheduler task
///
/// Arguments:
/// - `registry`: Shared aggregate registry
/// - `sink`: Downstream sink for drained events
/// - `drain_interval_ms`: Drain cadence in milliseconds
/// - `max_batch`: Maximum events per sink call
/// - `lineage_ttl`: Idle horizon for lineage pruning
///
/// This function runs indefinitely until cancelled.
pub async fn drain_scheduler_task(
    registry: Arc<AggregateRegistry>,
    sink: Arc<dyn EventSink>,
    drain_interval_ms: u64,
    max_batch: usize,
    lineage_ttl: ChronoDuration,
) {
    log::info!("⏰ Starting drain scheduler (interval: {}ms)", drain_interval_ms);

    let mut timer = interval(Duration::from_millis(drain_interval_ms.max(1)));

    loop {
        timer.tick().await;

        run_drain_cycle(&registry, sink.as_ref(), max_batch).await;

        let pruned = registry.prune_lineages(Utc::now(), lineage_ttl);
        if pruned > 0 {
            log::debug!(
                "Pruned {} idle job lineages ({} tracked)",
                pruned,
                registry.lineages().len()
            );
        }
    }
}
