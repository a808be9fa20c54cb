//! Offline replay
//!
//! Classifies a JSONL file of detections against a registry file and prints
//! the resulting aggregate buckets. Replaying the same input always yields
//! the same counts.
//!
//! Usage:
//!   cargo run --bin access-replay -- --registry config/vehicles.json --detections detections.jsonl
//!   cargo run --bin access-replay -- -r vehicles.json -d detections.jsonl --bucket-width-ms 3600000 --json
//!   cargo run --bin access-replay -- -r vehicles.json -d detections.jsonl --access-log out.jsonl

use access_engine::domain::Seq;
use access_engine::infra::Metrics;
use access_engine::io::registry_source::parse_vehicle_rows;
use access_engine::io::JsonlSink;
use access_engine::services::aggregator::DAY_MS;
use access_engine::services::{Engine, EngineSettings, PersistSink, Registry};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "access-replay")]
#[command(about = "Replay detections against a registry file and print bucket counts")]
struct Args {
    /// Registry file (JSON array of vehicle rows)
    #[arg(short, long)]
    registry: String,

    /// Detections file (one JSON detection per line)
    #[arg(short, long)]
    detections: String,

    /// Bucket width in milliseconds
    #[arg(long, default_value_t = DAY_MS)]
    bucket_width_ms: u64,

    /// Print buckets as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Also write the classified access log to this JSONL file
    #[arg(long)]
    access_log: Option<String>,
}

fn window_label(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Warnings only by default; stdout is reserved for the report
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let registry_json = std::fs::read_to_string(&args.registry)
        .with_context(|| format!("Failed to read registry file {}", args.registry))?;
    let vehicles = parse_vehicle_rows(&registry_json)
        .with_context(|| format!("Failed to parse registry file {}", args.registry))?;
    let registry = Arc::new(Registry::with_records(vehicles));

    let metrics = Arc::new(Metrics::new());
    let settings = EngineSettings {
        bucket_width_ms: args.bucket_width_ms.max(1),
        queue_capacity: 1,
        log_retention: 1,
        drain_grace: Duration::ZERO,
        start_after: Seq::ZERO,
    };
    let engine = Engine::new(settings, registry, None, metrics.clone());

    let sink = args.access_log.as_deref().map(JsonlSink::new);

    let file = std::fs::File::open(&args.detections)
        .with_context(|| format!("Failed to open detections file {}", args.detections))?;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        for result in engine.ingest_json(&line) {
            match result {
                Ok(event) => {
                    if let Some(sink) = &sink {
                        sink.append(&event)
                            .await
                            .with_context(|| format!("Failed to write seq {}", event.seq))?;
                    }
                }
                Err(e) => warn!(line = %(line_no + 1), error = %e, "replay_line_rejected"),
            }
        }
    }

    let buckets = engine.query(0, u64::MAX);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&buckets)?);
    } else {
        println!(
            "{:<22} {:>8} {:>8} {:>10} {:>13} {:>14}",
            "window_start", "total", "valid", "suspicious", "plate_unknown", "color_mismatch"
        );
        for b in &buckets {
            println!(
                "{:<22} {:>8} {:>8} {:>10} {:>13} {:>14}",
                window_label(b.window_start),
                b.total,
                b.valid,
                b.suspicious,
                b.plate_unknown,
                b.color_mismatch
            );
        }
        let totals = engine.totals();
        println!(
            "{:<22} {:>8} {:>8} {:>10} {:>13} {:>14}",
            "TOTAL",
            totals.total,
            totals.valid,
            totals.suspicious,
            totals.plate_unknown,
            totals.color_mismatch
        );
        println!("rejected: {}", metrics.malformed_total());
    }

    Ok(())
}
