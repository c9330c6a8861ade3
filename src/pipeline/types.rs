//! Core value types for provenance classification
//!
//! These mirror the records the event source emits: one `ProvenanceEvent`
//! per processor step, grouped under a job whose `JobLineage` remembers how
//! the job's first completion event was classified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one aggregate: a processor inside a feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub feed_name: String,
    pub processor_id: String,
}

impl AggregateKey {
    pub fn new(feed_name: impl Into<String>, processor_id: impl Into<String>) -> Self {
        Self {
            feed_name: feed_name.into(),
            processor_id: processor_id.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed_name, self.processor_id)
    }
}

/// Provenance event type reported by the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Create,
    Receive,
    Fetch,
    Send,
    Download,
    Drop,
    Expire,
    Fork,
    Join,
    Clone,
    ContentModified,
    AttributesModified,
    Route,
    AddInfo,
    Replay,
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Whether this event type marks a finished processing step.
    ///
    /// Lineage bookkeeping types (fork/join/clone, routing, info, replay)
    /// never finish a step and are ignored by the classifier.
    pub fn is_completion(&self) -> bool {
        !matches!(
            self,
            EventType::Fork
                | EventType::Join
                | EventType::Clone
                | EventType::Route
                | EventType::AddInfo
                | EventType::Replay
                | EventType::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Receive => "RECEIVE",
            EventType::Fetch => "FETCH",
            EventType::Send => "SEND",
            EventType::Download => "DOWNLOAD",
            EventType::Drop => "DROP",
            EventType::Expire => "EXPIRE",
            EventType::Fork => "FORK",
            EventType::Join => "JOIN",
            EventType::Clone => "CLONE",
            EventType::ContentModified => "CONTENT_MODIFIED",
            EventType::AttributesModified => "ATTRIBUTES_MODIFIED",
            EventType::Route => "ROUTE",
            EventType::AddInfo => "ADD_INFO",
            EventType::Replay => "REPLAY",
            EventType::Unknown => "UNKNOWN",
        }
    }
}

/// How the first completion event of a job was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirstEventType {
    #[default]
    Unset,
    Stream,
    Batch,
}

/// Per-job classification record, keyed by job id in the `LineageStore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLineage {
    /// Root flow id of the job
    pub job_id: String,

    /// Set once from `Unset`, never flipped between stream and batch
    pub first_event_type: FirstEventType,

    /// Last time the event source touched this job (pruning horizon)
    pub last_seen: DateTime<Utc>,
}

impl JobLineage {
    pub fn new(job_id: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            first_event_type: FirstEventType::Unset,
            last_seen: seen_at,
        }
    }

    /// Record the first-event classification.
    ///
    /// Returns `false` (and leaves the lineage untouched) when the job has
    /// already been decided.
    pub fn set_first_event_type(&mut self, kind: FirstEventType) -> bool {
        if self.first_event_type != FirstEventType::Unset || kind == FirstEventType::Unset {
            return false;
        }
        self.first_event_type = kind;
        true
    }
}

/// One provenance event as delivered by the event source
///
/// `job_id` points at the job lineage (the root flow); `flow_file_id` is the
/// flow that actually emitted the event. Child flows of a job carry a
/// different `flow_file_id` than the job root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub event_id: u64,
    pub event_type: EventType,

    /// Source-declared event time; events without one are rejected
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub flow_file_id: String,

    pub feed_name: String,
    pub processor_id: String,

    #[serde(default)]
    pub component_name: Option<String>,

    #[serde(default)]
    pub is_start_of_job: bool,
    #[serde(default)]
    pub is_end_of_job: bool,

    /// Set once the classifier commits this event to the stream bucket
    #[serde(default)]
    pub stream: bool,
}

impl ProvenanceEvent {
    pub fn aggregate_key(&self) -> AggregateKey {
        AggregateKey::new(self.feed_name.clone(), self.processor_id.clone())
    }

    /// True when the event was emitted by the job's originating flow
    ///
    /// The root flow is identified per event by `flow_file_id`: the lineage
    /// only stores the job id, which is the root flow's id.
    pub fn is_root_job(&self) -> bool {
        self.flow_file_id.is_empty() || self.flow_file_id == self.job_id
    }
}

impl PartialEq for ProvenanceEvent {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id && self.event_id == other.event_id
    }
}

impl Eq for ProvenanceEvent {}

/// Key for the per-job "last stream event" map
///
/// A job keeps one representative event per role (start, end, intermediate)
/// and event type, so start and end markers of a job both survive until drain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEventKey {
    pub job_id: String,
    pub event_type: EventType,
    pub is_end_of_job: bool,
    pub is_start_of_job: bool,
}

impl From<&ProvenanceEvent> for StreamEventKey {
    fn from(event: &ProvenanceEvent) -> Self {
        Self {
            job_id: event.job_id.clone(),
            event_type: event.event_type,
            is_end_of_job: event.is_end_of_job,
            is_start_of_job: event.is_start_of_job,
        }
    }
}
