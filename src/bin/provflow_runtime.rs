//! Provflow Runtime
//!
//! This binary wires the classification pipeline together:
//! - Reads JSONL ingest records from a file or stdin
//! - Spawns background tasks (reader, ingestion, drain scheduler)
//! - Appends drained events to a JSONL file (or logs them)
//!
//! Usage:
//!   provflow_runtime < records.jsonl
//!
//! Environment variables: see `PipelineConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use provflow::pipeline::{
    config::PipelineConfig,
    ingestion::{start_pipeline_ingestion, IngestRecord},
    lineage::LineageStore,
    registry::AggregateRegistry,
    scheduler::drain_scheduler_task,
    sink::{EventSink, JsonlEventSink, LogEventSink},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Forward every well-formed line to the pipeline; malformed lines are skipped
async fn forward_records<R>(reader: R, tx: mpsc::Sender<IngestRecord>) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut forwarded = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<IngestRecord>(&line) {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    warn!("⚠️  Ingest channel closed, stopping reader");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => {
                warn!("⚠️  Skipping malformed record on line {}: {}", line_no, e);
            }
        }
    }

    Ok(forwarded)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Provflow Runtime");

    // Load configuration
    let config = PipelineConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!(
        "   ├─ Input: {}",
        config.input_path.as_deref().unwrap_or("<stdin>")
    );
    info!("   ├─ Output: {}", config.output_path);
    info!("   ├─ Allowed gap: {}ms", config.allowed_gap_ms);
    info!("   ├─ Promotion threshold: {}", config.promotion_threshold);
    info!("   ├─ Drain interval: {}ms", config.drain_interval_ms);
    info!("   ├─ Max drain batch: {}", config.max_drain_batch);
    info!("   └─ Channel buffer: {} records", config.channel_buffer);

    let sink: Arc<dyn EventSink> = if config.output_path == "-" {
        Arc::new(LogEventSink)
    } else {
        Arc::new(JsonlEventSink::new(&config.output_path)?)
    };

    let lineages = Arc::new(LineageStore::new());
    let registry = Arc::new(AggregateRegistry::new(config.aggregate_settings(), lineages));
    info!("✅ Aggregate registry created");

    let (tx, rx) = mpsc::channel::<IngestRecord>(config.channel_buffer.max(1));

    // Task 1: Reader (event source)
    let input_path = config.input_path.clone();
    let reader_handle = tokio::spawn(async move {
        let result = match input_path {
            Some(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => forward_records(file, tx).await,
                Err(e) => Err(e),
            },
            None => forward_records(tokio::io::stdin(), tx).await,
        };
        match result {
            Ok(count) => info!("✅ Input exhausted after {} records", count),
            Err(e) => error!("❌ Input reader failed: {}", e),
        }
    });

    // Task 2: Drain scheduler
    let scheduler_handle = tokio::spawn(drain_scheduler_task(
        registry.clone(),
        sink.clone(),
        config.drain_interval_ms,
        config.max_drain_batch,
        config.lineage_ttl(),
    ));

    // Task 3: Ingestion (final drain when the reader closes the channel)
    let mut ingestion_handle = tokio::spawn(start_pipeline_ingestion(
        rx,
        registry.clone(),
        sink,
        config.max_drain_batch,
        config.channel_buffer,
    ));

    info!("✅ All background tasks running");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    let finished = tokio::select! {
        result = &mut ingestion_handle => Some(result),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!("❌ Failed to listen for CTRL+C: {}", err);
            }
            warn!("⚠️  Received CTRL+C, shutting down...");
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            // Dropping the reader's sender closes the channel
            reader_handle.abort();
            ingestion_handle.await
        }
    };
    scheduler_handle.abort();

    match result {
        Ok(summary) => info!(
            "✅ Provflow runtime stopped ({} accepted, {} rejected, {} aggregates)",
            summary.accepted,
            summary.rejected,
            registry.len()
        ),
        Err(e) => error!("❌ Ingestion task failed: {}", e),
    }

    Ok(())
}
