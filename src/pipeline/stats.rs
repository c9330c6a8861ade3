//! Running processor statistics
//!
//! Every event arrives with a delta computed by the event source. The
//! aggregate merges it into `ProcessorStats`; the finished-job count of the
//! delta is what drives the classifier's end-of-job correction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-event statistics delta supplied alongside each event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStatsDelta {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
    pub jobs_started: u64,
    pub jobs_finished: u64,
    pub jobs_failed: u64,
    pub flow_files_started: u64,
    pub flow_files_finished: u64,
    pub processors_failed: u64,
    pub job_duration_ms: u64,
    pub successful_job_duration_ms: u64,
    pub max_event_id: u64,
}

/// Point-in-time copy of the running counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Time of the most recent merge
    pub time: Option<DateTime<Utc>>,
    pub total_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
    pub jobs_started: u64,
    pub jobs_finished: u64,
    pub jobs_failed: u64,
    pub flow_files_started: u64,
    pub flow_files_finished: u64,
    pub processors_failed: u64,
    pub job_duration_ms: u64,
    pub successful_job_duration_ms: u64,
    pub max_event_id: u64,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }
}

/// Statistics accumulator for one (feed, processor) aggregate
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub feed_name: String,
    pub processor_id: String,
    counters: StatsSnapshot,
}

impl ProcessorStats {
    pub fn new(feed_name: impl Into<String>, processor_id: impl Into<String>) -> Self {
        Self {
            feed_name: feed_name.into(),
            processor_id: processor_id.into(),
            counters: StatsSnapshot::default(),
        }
    }

    /// Merge a delta into the running counters.
    ///
    /// Counters saturate at `u64::MAX`; deltas come from untrusted input.
    ///
    /// Returns the number of jobs the delta reports as finished. Exactly one
    /// means the event being processed is the one that completed its job.
    pub fn merge(&mut self, delta: &EventStatsDelta, at: DateTime<Utc>) -> u64 {
        let c = &mut self.counters;

        c.total_count = c.total_count.saturating_add(1);
        c.bytes_in = c.bytes_in.saturating_add(delta.bytes_in);
        c.bytes_out = c.bytes_out.saturating_add(delta.bytes_out);
        c.duration_ms = c.duration_ms.saturating_add(delta.duration_ms);
        c.jobs_started = c.jobs_started.saturating_add(delta.jobs_started);
        c.jobs_finished = c.jobs_finished.saturating_add(delta.jobs_finished);
        c.jobs_failed = c.jobs_failed.saturating_add(delta.jobs_failed);
        c.flow_files_started = c.flow_files_started.saturating_add(delta.flow_files_started);
        c.flow_files_finished = c.flow_files_finished.saturating_add(delta.flow_files_finished);
        c.processors_failed = c.processors_failed.saturating_add(delta.processors_failed);
        c.job_duration_ms = c.job_duration_ms.saturating_add(delta.job_duration_ms);
        c.successful_job_duration_ms = c.successful_job_duration_ms.saturating_add(delta.successful_job_duration_ms);
        c.max_event_id = c.max_event_id.max(delta.max_event_id);
        c.time = Some(c.time.map_or(at, |t| t.max(at)));

        delta.jobs_finished
    }

    /// Zero all counters (once per drain cycle)
    pub fn reset(&mut self) {
        self.counters = StatsSnapshot::default();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.counters.clone()
    }
}
