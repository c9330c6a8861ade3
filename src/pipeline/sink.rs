//! Downstream sinks for drained events
//!
//! The scheduler hands each drained batch to an `EventSink`, at most
//! `max_drain_batch` events per call. Delivery retry is the sink's concern;
//! a failed call is logged and the batch is not re-queued.

use super::types::{AggregateKey, ProvenanceEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receiver of classified events, one bounded batch per call
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one batch of drained events for an aggregate
    async fn deliver(&self, key: &AggregateKey, events: &[ProvenanceEvent]) -> Result<(), SinkError>;

    /// Get sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Appends every delivered event as one JSON line
pub struct JsonlEventSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::info!("📝 Writing drained events to: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn deliver(&self, _key: &AggregateKey, events: &[ProvenanceEvent]) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        for event in events {
            let json = serde_json::to_string(event)?;
            writeln!(writer, "{}", json)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "JSONL"
    }
}

/// Logs delivered events instead of writing them anywhere
#[derive(Debug, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn deliver(&self, key: &AggregateKey, events: &[ProvenanceEvent]) -> Result<(), SinkError> {
        for event in events {
            log::info!(
                "{} event {} job {} ({}) stream={} end_of_job={}",
                key,
                event.event_id,
                event.job_id,
                event.event_type.as_str(),
                event.stream,
                event.is_end_of_job
            );
        }
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "LOG"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::EventType;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn make_event(event_id: u64, stream: bool) -> ProvenanceEvent {
        ProvenanceEvent {
            event_id,
            event_type: EventType::Drop,
            event_time: Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()),
            job_id: format!("job-{}", event_id),
            flow_file_id: format!("job-{}", event_id),
            feed_name: "orders".to_string(),
            processor_id: "proc-1".to_string(),
            component_name: None,
            is_start_of_job: true,
            is_end_of_job: false,
            stream,
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("drained.jsonl");
        let sink = JsonlEventSink::new(&path).unwrap();
        let key = AggregateKey::new("orders", "proc-1");

        sink.deliver(&key, &[make_event(1, false), make_event(2, true)])
            .await
            .unwrap();
        sink.deliver(&key, &[make_event(3, false)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        let second: ProvenanceEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event_id, 2);
        assert!(second.stream);
        assert_eq!(sink.sink_type(), "JSONL");
        assert_eq!(sink.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        let sink = LogEventSink;
        let key = AggregateKey::new("orders", "proc-1");

        assert!(sink.deliver(&key, &[make_event(1, false)]).await.is_ok());
        assert!(sink.deliver(&key, &[]).await.is_ok());
        assert_eq!(sink.sink_type(), "LOG");
    }
}
