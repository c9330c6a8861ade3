//! Feed/processor aggregate - owns classifier state for one key
//!
//! ## Concurrency
//!
//! Producers call `add_event` from any number of threads while a scheduler
//! calls `drain` on its own cadence. Every mutation happens under one
//! `parking_lot::Mutex`, and each critical section ends with
//! `MutexGuard::unlock_fair`, which hands the lock directly to the longest
//! waiter. A burst of ingestion therefore cannot starve a pending drain.
//!
//! Nothing inside the lock does I/O; drained events are returned by value.

use super::classifier::{Classification, ClassificationCounters, StreamClassifier};
use super::config::AggregateSettings;
use super::lineage::LineageStore;
use super::stats::{EventStatsDelta, ProcessorStats, StatsSnapshot};
use super::types::{AggregateKey, ProvenanceEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Wall-clock source, injectable for tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Reasons a single event is refused before it touches aggregate state
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventRejected {
    #[error("event {event_id} has no event time")]
    MissingEventTime { event_id: u64 },

    #[error("event {event_id} has no job id")]
    MissingJobId { event_id: u64 },

    #[error("event {event_id} references unknown job {job_id}")]
    UnknownLineage { event_id: u64, job_id: String },
}

/// Result of one drain cycle
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Events for the downstream sink (batch + reconciled)
    pub delivered: Vec<ProvenanceEvent>,

    /// Events confirmed as stream during the cycle
    pub streamed: Vec<ProvenanceEvent>,

    /// Provisional events flushed to batch by the timeout check
    pub timed_out: usize,

    /// Stream events re-queued because their job began as batch
    pub reconciled: usize,

    /// Running statistics as they stood before the per-cycle reset
    pub stats: StatsSnapshot,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.streamed.is_empty()
    }
}

/// Read-only view of an aggregate for logging and tests
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSummary {
    pub key: AggregateKey,
    pub processor_name: Option<String>,
    pub counters: ClassificationCounters,
    pub consecutive_near_window: u32,
    pub provisional: usize,
    pub confirmed_stream: usize,
    pub pending_delivery: usize,
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

struct AggregateState {
    classifier: StreamClassifier,
    stats: ProcessorStats,
    processor_name: Option<String>,

    /// Wall-clock time of the last mutation
    last_observed_at: Option<DateTime<Utc>>,
}

/// Classification state for one (feed, processor) pair
pub struct FeedProcessorAggregate {
    key: AggregateKey,
    lineages: Arc<LineageStore>,
    clock: Clock,
    state: Mutex<AggregateState>,
}

impl FeedProcessorAggregate {
    /// Create an aggregate using system time
    pub fn new(key: AggregateKey, settings: AggregateSettings, lineages: Arc<LineageStore>) -> Self {
        Self::new_with_clock(key, settings, lineages, system_clock())
    }

    /// Create an aggregate with a custom clock
    ///
    /// Used for testing with deterministic timestamps.
    pub fn new_with_clock(
        key: AggregateKey,
        settings: AggregateSettings,
        lineages: Arc<LineageStore>,
        clock: Clock,
    ) -> Self {
        log::info!(
            "New aggregate for {} (allowed gap: {}ms, promotion threshold: {})",
            key,
            settings.allowed_gap.num_milliseconds(),
            settings.promotion_threshold
        );

        let stats = ProcessorStats::new(key.feed_name.clone(), key.processor_id.clone());
        Self {
            key,
            lineages,
            clock,
            state: Mutex::new(AggregateState {
                classifier: StreamClassifier::new(
                    settings.allowed_gap,
                    settings.promotion_threshold,
                ),
                stats,
                processor_name: None,
                last_observed_at: None,
            }),
        }
    }

    pub fn key(&self) -> &AggregateKey {
        &self.key
    }

    /// Classify one event and merge its statistics delta
    ///
    /// Malformed events are rejected without touching any state; callers
    /// log and move on.
    pub fn add_event(
        &self,
        event: ProvenanceEvent,
        delta: &EventStatsDelta,
    ) -> Result<Classification, EventRejected> {
        let event_time = event.event_time.ok_or(EventRejected::MissingEventTime {
            event_id: event.event_id,
        })?;
        if event.job_id.is_empty() {
            return Err(EventRejected::MissingJobId {
                event_id: event.event_id,
            });
        }
        if !self.lineages.contains(&event.job_id) {
            return Err(EventRejected::UnknownLineage {
                event_id: event.event_id,
                job_id: event.job_id,
            });
        }

        let now = (self.clock)();
        let mut state = self.state.lock();

        if state.processor_name.is_none() {
            if let Some(name) = event.component_name.as_ref().filter(|n| !n.is_empty()) {
                state.processor_name = Some(name.clone());
            }
        }

        let finished_jobs = state.stats.merge(delta, event_time);
        let outcome = state
            .classifier
            .classify(event, event_time, finished_jobs, &self.lineages);
        state.last_observed_at = Some(now);

        MutexGuard::unlock_fair(state);
        Ok(outcome)
    }

    /// Collect the events ready for the downstream sink
    ///
    /// Returns an empty vector when nothing is pending.
    pub fn drain(&self) -> Vec<ProvenanceEvent> {
        self.drain_cycle().delivered
    }

    /// Run one full drain cycle: timeout flush, batch-origin reconciliation,
    /// then emit-and-clear. The provisional buffer survives the cycle.
    pub fn drain_cycle(&self) -> DrainReport {
        self.drain_with(false)
    }

    /// Drain cycle for shutdown: provisional events are flushed to batch
    /// even if the window has not lapsed yet.
    pub fn drain_final(&self) -> DrainReport {
        self.drain_with(true)
    }

    fn drain_with(&self, force: bool) -> DrainReport {
        let now = (self.clock)();
        let mut state = self.state.lock();

        let timed_out = if force {
            state.classifier.flush_provisional(&self.lineages)
        } else {
            state.classifier.flush_if_timed_out(now, &self.lineages)
        };
        let reconciled = state.classifier.reconcile_batch_origin(&self.lineages);
        let (delivered, streamed) = state.classifier.take_cycle();
        let stats = state.stats.snapshot();
        state.stats.reset();
        let name = state
            .processor_name
            .clone()
            .unwrap_or_else(|| self.key.processor_id.clone());

        MutexGuard::unlock_fair(state);

        if reconciled > 0 {
            log::info!(
                "Adding {} events for {} ({}) since they originated from a batch event",
                reconciled,
                self.key,
                name
            );
        }
        if !delivered.is_empty() || !streamed.is_empty() {
            log::debug!(
                "Drained {} ({}): {} delivered, {} stream, {} timed out",
                self.key,
                name,
                delivered.len(),
                streamed.len(),
                timed_out
            );
        }

        DrainReport {
            delivered,
            streamed,
            timed_out,
            reconciled,
            stats,
        }
    }

    /// Job ids that buffered events still resolve through the lineage store
    pub fn referenced_jobs(&self) -> Vec<String> {
        let state = self.state.lock();
        let jobs: Vec<String> = state
            .classifier
            .referenced_jobs()
            .map(str::to_string)
            .collect();
        MutexGuard::unlock_fair(state);
        jobs
    }

    pub fn summary(&self) -> AggregateSummary {
        let state = self.state.lock();
        let summary = AggregateSummary {
            key: self.key.clone(),
            processor_name: state.processor_name.clone(),
            counters: state.classifier.counters(),
            consecutive_near_window: state.classifier.consecutive_near_window(),
            provisional: state.classifier.provisional().len(),
            confirmed_stream: state.classifier.confirmed_stream().len(),
            pending_delivery: state.classifier.pending_delivery().len(),
            last_event_time: state.classifier.last_event_time(),
            last_observed_at: state.last_observed_at,
        };
        MutexGuard::unlock_fair(state);
        summary
    }
}

impl std::fmt::Debug for FeedProcessorAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedProcessorAggregate")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{EventType, FirstEventType};
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    /// Helper to create a completion event that starts its own job
    fn make_event(event_id: u64, job_id: &str, millis: i64) -> ProvenanceEvent {
        ProvenanceEvent {
            event_id,
            event_type: EventType::Drop,
            event_time: Some(at(millis)),
            job_id: job_id.to_string(),
            flow_file_id: job_id.to_string(),
            feed_name: "orders".to_string(),
            processor_id: "proc-1".to_string(),
            component_name: Some("PutHDFS".to_string()),
            is_start_of_job: true,
            is_end_of_job: false,
            stream: false,
        }
    }

    /// Aggregate whose clock is driven by the returned handle (millis)
    fn make_aggregate() -> (FeedProcessorAggregate, Arc<LineageStore>, Arc<AtomicI64>) {
        let lineages = Arc::new(LineageStore::new());
        let now = Arc::new(AtomicI64::new(0));
        let now_handle = now.clone();
        let clock: Clock = Arc::new(move || at(now_handle.load(Ordering::SeqCst)));
        let aggregate = FeedProcessorAggregate::new_with_clock(
            AggregateKey::new("orders", "proc-1"),
            AggregateSettings::new(Duration::milliseconds(1_000), 3),
            lineages.clone(),
            clock,
        );
        (aggregate, lineages, now)
    }

    fn add(
        aggregate: &FeedProcessorAggregate,
        lineages: &LineageStore,
        event: ProvenanceEvent,
    ) -> Classification {
        lineages.track(&event.job_id, event.event_time.unwrap());
        aggregate
            .add_event(event, &EventStatsDelta::default())
            .unwrap()
    }

    #[test]
    fn test_threshold_promotion_through_aggregate() {
        let (aggregate, lineages, now) = make_aggregate();
        now.store(650, Ordering::SeqCst);

        let outcomes: Vec<Classification> = [0, 200, 400, 600]
            .iter()
            .enumerate()
            .map(|(i, t)| add(&aggregate, &lineages, make_event(i as u64, &format!("job-{}", i), *t)))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                Classification::Provisional,
                Classification::Provisional,
                Classification::Stream,
                Classification::Stream
            ]
        );

        let report = aggregate.drain_cycle();
        assert!(report.delivered.is_empty());
        assert_eq!(report.streamed.len(), 4);
        assert!(report.streamed.iter().all(|e| e.stream));
    }

    #[test]
    fn test_gap_flush_delivers_batch() {
        let (aggregate, lineages, now) = make_aggregate();

        add(&aggregate, &lineages, make_event(1, "job-1", 0));
        add(&aggregate, &lineages, make_event(2, "job-2", 2_000));
        now.store(2_100, Ordering::SeqCst);

        let drained = aggregate.drain();

        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].event_id, 1);
        assert!(drained.iter().all(|e| !e.stream));
        assert_eq!(lineages.first_event_type("job-1"), Some(FirstEventType::Batch));
    }

    #[test]
    fn test_drain_twice_is_idempotent() {
        let (aggregate, lineages, now) = make_aggregate();

        add(&aggregate, &lineages, make_event(1, "job-1", 0));
        add(&aggregate, &lineages, make_event(2, "job-2", 5_000));
        now.store(5_010, Ordering::SeqCst);

        let before = aggregate.summary();
        assert!(!aggregate.drain().is_empty());
        assert!(aggregate.drain().is_empty());
        let after = aggregate.summary();

        assert_eq!(before.counters, after.counters);
        assert_eq!(before.consecutive_near_window, after.consecutive_near_window);
        assert_eq!(after.pending_delivery, 0);
    }

    #[test]
    fn test_drain_on_fresh_aggregate_is_empty() {
        let (aggregate, _lineages, now) = make_aggregate();
        now.store(1_000_000, Ordering::SeqCst);

        let report = aggregate.drain_cycle();

        assert!(report.is_empty());
        assert_eq!(report.timed_out, 0);
        assert!(report.stats.is_empty());
    }

    #[test]
    fn test_timeout_flush_on_drain() {
        let (aggregate, lineages, now) = make_aggregate();

        add(&aggregate, &lineages, make_event(1, "job-1", 0));
        add(&aggregate, &lineages, make_event(2, "job-2", 300));

        // Still inside the window: provisional stays put
        now.store(900, Ordering::SeqCst);
        assert!(aggregate.drain().is_empty());
        assert_eq!(aggregate.summary().provisional, 2);

        // Traffic stopped; the window lapses
        now.store(1_301, Ordering::SeqCst);
        let report = aggregate.drain_cycle();

        assert_eq!(report.timed_out, 2);
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(aggregate.summary().provisional, 0);
        assert_eq!(lineages.first_event_type("job-2"), Some(FirstEventType::Batch));
    }

    #[test]
    fn test_drain_final_flushes_inside_window() {
        let (aggregate, lineages, now) = make_aggregate();

        add(&aggregate, &lineages, make_event(1, "job-1", 0));
        add(&aggregate, &lineages, make_event(2, "job-2", 100));
        now.store(150, Ordering::SeqCst);

        assert!(aggregate.drain_cycle().is_empty());
        assert_eq!(aggregate.summary().provisional, 2);

        let report = aggregate.drain_final();

        assert_eq!(report.timed_out, 2);
        let ids: Vec<u64> = report.delivered.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(aggregate.summary().provisional, 0);
        assert_eq!(lineages.first_event_type("job-1"), Some(FirstEventType::Batch));
    }

    #[test]
    fn test_rejects_malformed_events() {
        let (aggregate, lineages, _now) = make_aggregate();

        let mut no_time = make_event(1, "job-1", 0);
        no_time.event_time = None;
        lineages.track("job-1", at(0));
        assert_eq!(
            aggregate.add_event(no_time, &EventStatsDelta::default()),
            Err(EventRejected::MissingEventTime { event_id: 1 })
        );

        let no_job = make_event(2, "", 0);
        assert_eq!(
            aggregate.add_event(no_job, &EventStatsDelta::default()),
            Err(EventRejected::MissingJobId { event_id: 2 })
        );

        let unknown = make_event(3, "never-tracked", 0);
        assert!(matches!(
            aggregate.add_event(unknown, &EventStatsDelta::default()),
            Err(EventRejected::UnknownLineage { event_id: 3, .. })
        ));

        let summary = aggregate.summary();
        assert_eq!(summary.counters.events, 0);
        assert_eq!(summary.last_event_time, None);
        assert_eq!(summary.last_observed_at, None);

        // A good event afterwards is classified normally
        assert_eq!(
            add(&aggregate, &lineages, make_event(4, "job-4", 10)),
            Classification::Provisional
        );
    }

    #[test]
    fn test_end_of_job_correction_uses_stats_delta() {
        let (aggregate, lineages, now) = make_aggregate();

        let mut child = make_event(1, "job-1", 0);
        child.flow_file_id = "child-1".to_string();
        child.is_start_of_job = false;
        lineages.track("job-1", at(0));
        let finished = EventStatsDelta {
            jobs_finished: 1,
            ..Default::default()
        };
        aggregate.add_event(child, &finished).unwrap();
        add(&aggregate, &lineages, make_event(2, "job-2", 5_000));
        now.store(5_001, Ordering::SeqCst);

        let report = aggregate.drain_cycle();

        assert!(report.delivered[0].is_end_of_job);
        assert_eq!(report.stats.jobs_finished, 1);
        assert_eq!(report.stats.total_count, 2);
        // Stats reset for the next cycle
        assert!(aggregate.drain_cycle().stats.is_empty());
    }

    #[test]
    fn test_captures_processor_name_once() {
        let (aggregate, lineages, _now) = make_aggregate();

        let mut first = make_event(1, "job-1", 0);
        first.component_name = Some(String::new());
        add(&aggregate, &lineages, first);
        add(&aggregate, &lineages, make_event(2, "job-2", 10));
        let mut third = make_event(3, "job-3", 20);
        third.component_name = Some("Other".to_string());
        add(&aggregate, &lineages, third);

        assert_eq!(aggregate.summary().processor_name.as_deref(), Some("PutHDFS"));
    }

    #[test]
    fn test_records_observation_time() {
        let (aggregate, lineages, now) = make_aggregate();
        now.store(42_000, Ordering::SeqCst);

        add(&aggregate, &lineages, make_event(1, "job-1", 100));

        let summary = aggregate.summary();
        assert_eq!(summary.last_observed_at, Some(at(42_000)));
        assert_eq!(summary.last_event_time, Some(at(100)));
    }

    #[test]
    fn test_concurrent_ingest_and_drain_loses_nothing() {
        let (aggregate, lineages, now) = make_aggregate();
        let aggregate = Arc::new(aggregate);
        now.store(1_000_000_000, Ordering::SeqCst);

        let producers = 4;
        let per_producer = 250;
        let mut handles = Vec::new();

        for p in 0..producers {
            let aggregate = aggregate.clone();
            let lineages = lineages.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..per_producer {
                    let id = (p * per_producer + i) as u64;
                    let job = format!("job-{}-{}", p, i % 10);
                    // Sparse and dense runs interleave across producers
                    let millis = (id as i64) * if p % 2 == 0 { 50 } else { 1_500 };
                    lineages.track(&job, at(millis));
                    aggregate
                        .add_event(make_event(id, &job, millis), &EventStatsDelta::default())
                        .unwrap();
                }
            }));
        }

        let drainer = {
            let aggregate = aggregate.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    let report = aggregate.drain_cycle();
                    seen.extend(report.delivered);
                    seen.extend(report.streamed);
                    std::thread::yield_now();
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = drainer.join().unwrap();

        // Final drain flushes whatever is still provisional (clock is far ahead)
        let report = aggregate.drain_cycle();
        seen.extend(report.delivered);
        seen.extend(report.streamed);

        let unique: HashSet<u64> = seen.iter().map(|e| e.event_id).collect();
        assert_eq!(unique.len(), producers * per_producer);
        assert_eq!(aggregate.summary().provisional, 0);
    }
}
