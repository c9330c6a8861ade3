//! # Stream/Batch Classification Pipeline
//!
//! Classifies provenance completion events per (feed, processor) pair as
//! either part of a high-frequency stream or an isolated batch job, and
//! hands the results to a downstream sink on a fixed cadence.
//!
//! ## Architecture
//!
//! 1. The event source forwards `IngestRecord`s over an mpsc channel
//! 2. Ingestion tracks each job lineage and routes the event to its aggregate
//! 3. Each aggregate runs the hysteresis classifier under a fair lock
//! 4. The drain scheduler periodically collects batch events and clears stream events
//! 5. Drained events go to an `EventSink` in bounded batches
//!
//! Stream events are summarized by the aggregate's statistics, not
//! delivered one by one. A stream event is only sent downstream when its
//! job turns out to have started as batch.
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (ProvenanceEvent, AggregateKey, JobLineage)
//! - `lineage` - Job lineage arena
//! - `stats` - Per-aggregate running statistics
//! - `classifier` - Windowing and promotion logic
//! - `aggregate` - Lock-guarded aggregate with add/drain
//! - `registry` - Concurrent aggregate map
//! - `sink` - Downstream sink trait and implementations
//! - `config` - Environment configuration
//! - `ingestion` - Channel consumer
//! - `scheduler` - Periodic drain task

pub mod types;
pub mod lineage;
pub mod stats;
pub mod classifier;
pub mod aggregate;
pub mod registry;
pub mod sink;
pub mod config;
pub mod ingestion;
pub mod scheduler;

// Re-export commonly used types
pub use types::{AggregateKey, EventType, FirstEventType, JobLineage, ProvenanceEvent};
pub use lineage::LineageStore;
pub use stats::{EventStatsDelta, ProcessorStats, StatsSnapshot};
pub use classifier::{Classification, StreamClassifier};
pub use aggregate::{DrainReport, EventRejected, FeedProcessorAggregate};
pub use registry::AggregateRegistry;
pub use sink::{EventSink, JsonlEventSink, LogEventSink, SinkError};
pub use config::{AggregateSettings, PipelineConfig};
pub use ingestion::IngestRecord;
