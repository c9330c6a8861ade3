//! Stream/batch classifier
//!
//! Decides, one completion event at a time, whether the events of a
//! (feed, processor) pair form a stream (many closely spaced jobs) or
//! isolated batch jobs.
//!
//! ## Algorithm
//!
//! ```text
//! completion event e
//!     ↓
//! end-of-job correction (delta finished one job, e from a child flow)
//!     ↓
//! lineage already STREAM? ──yes──→ confirmed_stream
//!     ↓ no
//! e.time < last_event_time + allowed_gap?
//!     ├─ yes: near_window += 1
//!     │        ├─ near_window >= threshold → provisional + e → confirmed_stream
//!     │        └─ otherwise               → provisional (hysteresis hold)
//!     └─ no:  provisional + e → pending_delivery (batch), near_window = 0
//! ```
//!
//! The classifier holds no lock of its own. `FeedProcessorAggregate` owns it
//! behind a fair mutex and is the only caller.

use super::lineage::LineageStore;
use super::types::{FirstEventType, ProvenanceEvent, StreamEventKey};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Where a single event ended up after `classify`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not a completion event; observed only
    Ignored,
    /// Held in the hysteresis buffer
    Provisional,
    Stream,
    Batch,
}

/// Cumulative classification counters (never reset by drains)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationCounters {
    pub events: u64,
    pub stream: u64,
    pub batch: u64,
    pub reconciled: u64,
}

/// Per-aggregate windowing state
#[derive(Debug)]
pub struct StreamClassifier {
    allowed_gap: Duration,
    promotion_threshold: u32,

    /// Window anchor: event time of the most recent event
    last_event_time: Option<DateTime<Utc>>,

    /// Consecutive near-window arrivals since the last gap
    consecutive_near_window: u32,

    provisional: Vec<ProvenanceEvent>,
    confirmed_stream: Vec<ProvenanceEvent>,
    pending_delivery: Vec<ProvenanceEvent>,
    last_stream_event_per_job: HashMap<StreamEventKey, ProvenanceEvent>,

    counters: ClassificationCounters,
}

impl StreamClassifier {
    pub fn new(allowed_gap: Duration, promotion_threshold: u32) -> Self {
        Self {
            allowed_gap,
            promotion_threshold: promotion_threshold.max(1),
            last_event_time: None,
            consecutive_near_window: 0,
            provisional: Vec::new(),
            confirmed_stream: Vec::new(),
            pending_delivery: Vec::new(),
            last_stream_event_per_job: HashMap::new(),
            counters: ClassificationCounters::default(),
        }
    }

    /// Classify one validated event.
    ///
    /// `finished_jobs` is the result of merging the event's stats delta.
    /// The window anchor moves to `event_time` for every event, completion
    /// or not.
    pub fn classify(
        &mut self,
        mut event: ProvenanceEvent,
        event_time: DateTime<Utc>,
        finished_jobs: u64,
        lineages: &LineageStore,
    ) -> Classification {
        let anchor = *self.last_event_time.get_or_insert(event_time);

        let outcome = if !event.event_type.is_completion() {
            log::debug!(
                "Non completion event {} ({}) for job {}",
                event.event_id,
                event.event_type.as_str(),
                event.job_id
            );
            Classification::Ignored
        } else {
            self.counters.events += 1;

            if finished_jobs == 1 && !event.is_root_job() {
                log::debug!(
                    "Marking event {} as end of job {} (already end of job: {})",
                    event.event_id,
                    event.job_id,
                    event.is_end_of_job
                );
                event.is_end_of_job = true;
            }

            if lineages.first_event_type(&event.job_id) == Some(FirstEventType::Stream) {
                self.move_to_stream(event, lineages);
                Classification::Stream
            } else if event_time < anchor + self.allowed_gap {
                self.consecutive_near_window = self.consecutive_near_window.saturating_add(1);
                if self.consecutive_near_window >= self.promotion_threshold {
                    self.promote_provisional_to_stream(lineages);
                    self.move_to_stream(event, lineages);
                    Classification::Stream
                } else {
                    self.provisional.push(event);
                    Classification::Provisional
                }
            } else {
                self.provisional.push(event);
                self.flush_provisional_to_batch(lineages);
                self.consecutive_near_window = 0;
                Classification::Batch
            }
        };

        self.last_event_time = Some(event_time);
        outcome
    }

    /// Flush the hysteresis buffer to batch if the window has lapsed at `now`.
    ///
    /// Returns the number of events flushed.
    pub fn flush_if_timed_out(&mut self, now: DateTime<Utc>, lineages: &LineageStore) -> usize {
        match self.last_event_time {
            Some(last) if now > last + self.allowed_gap => self.flush_provisional_to_batch(lineages),
            _ => 0,
        }
    }

    /// Flush the hysteresis buffer to batch regardless of the clock.
    ///
    /// Used on shutdown, when no later event or timeout will come.
    pub fn flush_provisional(&mut self, lineages: &LineageStore) -> usize {
        self.flush_provisional_to_batch(lineages)
    }

    /// Job ids still referenced by buffered events
    pub fn referenced_jobs(&self) -> impl Iterator<Item = &str> {
        self.provisional
            .iter()
            .map(|e| e.job_id.as_str())
            .chain(self.last_stream_event_per_job.keys().map(|k| k.job_id.as_str()))
    }

    /// Queue the last stream event of every job whose lineage turned out
    /// to be batch, so the job still shows up downstream.
    pub fn reconcile_batch_origin(&mut self, lineages: &LineageStore) -> usize {
        let reconciled: Vec<ProvenanceEvent> = self
            .last_stream_event_per_job
            .values()
            .filter(|e| lineages.first_event_type(&e.job_id) == Some(FirstEventType::Batch))
            .cloned()
            .collect();

        let count = reconciled.len();
        self.counters.reconciled += count as u64;
        self.pending_delivery.extend(reconciled);
        count
    }

    /// Hand out this cycle's pending and stream events and clear the
    /// per-cycle buffers. The provisional buffer is left alone.
    pub fn take_cycle(&mut self) -> (Vec<ProvenanceEvent>, Vec<ProvenanceEvent>) {
        let delivered = std::mem::take(&mut self.pending_delivery);
        let streamed = std::mem::take(&mut self.confirmed_stream);
        self.last_stream_event_per_job.clear();
        (delivered, streamed)
    }

    fn move_to_stream(&mut self, mut event: ProvenanceEvent, lineages: &LineageStore) {
        event.stream = true;
        if event.is_start_of_job {
            lineages.mark_first_event(&event.job_id, FirstEventType::Stream);
        }
        self.last_stream_event_per_job
            .insert(StreamEventKey::from(&event), event.clone());
        self.confirmed_stream.push(event);
        self.counters.stream += 1;
    }

    fn promote_provisional_to_stream(&mut self, lineages: &LineageStore) {
        let held = std::mem::take(&mut self.provisional);
        if !held.is_empty() {
            log::debug!("Promoting {} provisional events to stream", held.len());
        }
        for event in held {
            self.move_to_stream(event, lineages);
        }
    }

    fn flush_provisional_to_batch(&mut self, lineages: &LineageStore) -> usize {
        if self.provisional.is_empty() {
            return 0;
        }

        let count = self.provisional.len();
        for event in self.provisional.iter().filter(|e| e.is_start_of_job) {
            lineages.mark_first_event(&event.job_id, FirstEventType::Batch);
        }
        log::debug!("Marking {} provisional events as batch", count);

        self.counters.batch += count as u64;
        self.pending_delivery.append(&mut self.provisional);
        count
    }

    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    pub fn consecutive_near_window(&self) -> u32 {
        self.consecutive_near_window
    }

    pub fn provisional(&self) -> &[ProvenanceEvent] {
        &self.provisional
    }

    pub fn confirmed_stream(&self) -> &[ProvenanceEvent] {
        &self.confirmed_stream
    }

    pub fn pending_delivery(&self) -> &[ProvenanceEvent] {
        &self.pending_delivery
    }

    pub fn tracked_stream_jobs(&self) -> usize {
        self.last_stream_event_per_job.len()
    }

    pub fn counters(&self) -> ClassificationCounters {
        self.counters
    }
}
