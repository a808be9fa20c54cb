//! Access-log sinks
//!
//! Each classified event is stored as one `AccessLogRow`:
//! - `JsonlSink` appends JSON lines to a local file
//! - `HttpSink` inserts into the store's `access_logs` table
//! - `MemorySink` keeps rows in memory (tests, replay)

use crate::domain::access_log::{AccessLogRow, ClassifiedEvent};
use crate::domain::error::{EngineError, EngineResult};
use crate::domain::types::Seq;
use crate::infra::config::Config;
use crate::services::persist_worker::PersistSink;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Append-only JSONL access log
///
/// The file is opened on first write and kept open. A failed write drops
/// the handle so the next append reopens the file.
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(file_path = %path.display(), "jsonl_sink_initialized");
        Self { path, file: tokio::sync::Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest `seq` already in the file, so numbering continues after a restart.
    /// Unreadable lines are skipped; a missing file yields `Seq::ZERO`.
    pub fn last_sequence(&self) -> Seq {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Seq::ZERO,
        };

        let mut last = 0u64;
        let mut unreadable = 0usize;
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                unreadable += 1;
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&line)
                .ok()
                .and_then(|v| v.get("seq").and_then(serde_json::Value::as_u64))
            {
                Some(seq) => last = last.max(seq),
                None => unreadable += 1,
            }
        }

        if unreadable > 0 {
            warn!(file = %self.path.display(), lines = %unreadable, "jsonl_sink_unreadable_lines");
        }
        Seq(last)
    }

    async fn open(&self) -> std::io::Result<tokio::fs::File> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file =
            tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        debug!(file = %self.path.display(), "jsonl_sink_opened");
        Ok(file)
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open().await?,
        };

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        *guard = Some(file);
        debug!(file = %self.path.display(), bytes = %buf.len(), "access_log_written");
        Ok(())
    }
}

#[async_trait]
impl PersistSink for JsonlSink {
    async fn append(&self, event: &ClassifiedEvent) -> EngineResult<()> {
        let line = serde_json::to_string(&event.to_access_log())
            .map_err(|e| EngineError::PersistFailure(format!("encode failed: {e}")))?;
        self.append_line(&line)
            .await
            .map_err(|e| EngineError::PersistFailure(format!("{}: {e}", self.path.display())))
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// PostgREST-style insert: `POST {url}/rest/v1/{table}`
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSink {
    pub fn new(base_url: &str, table: &str, api_key: Option<&str>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .http1_only()
            .build()
            .context("failed to build access-log http client")?;
        let endpoint = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table);
        info!(endpoint = %endpoint, "http_sink_initialized");
        Ok(Self { client, endpoint, api_key: api_key.map(str::to_string) })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let url = config.persist_url();
        if url.is_empty() {
            anyhow::bail!("persistence.url is required when persistence.sink = \"http\"");
        }
        Self::new(url, config.persist_table(), config.persist_api_key())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PersistSink for HttpSink {
    async fn append(&self, event: &ClassifiedEvent) -> EngineResult<()> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Prefer", "return=minimal")
            .json(&event.to_access_log());
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::PersistFailure(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::PersistFailure(format!("store returned {status}")));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// In-memory access log
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<AccessLogRow>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<AccessLogRow> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// While set, every append fails
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl PersistSink for MemorySink {
    async fn append(&self, event: &ClassifiedEvent) -> EngineResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::PersistFailure("memory sink failing".to_string()));
        }
        self.rows.lock().push(event.to_access_log());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DetectionEvent, VehicleRecord};
    use crate::services::classifier::Classifier;
    use crate::services::matcher::match_detection;
    use crate::services::registry::RegistrySnapshot;
    use std::fs;
    use tempfile::tempdir;

    fn classified(specs: &[(&str, &str)]) -> Vec<ClassifiedEvent> {
        let snapshot = RegistrySnapshot::from_records(
            vec![VehicleRecord::new("ABC1234", "Toyota Camry", "Red")],
            1,
        );
        let mut classifier = Classifier::new();
        specs
            .iter()
            .map(|(plate, color)| {
                let detection = DetectionEvent::new(1_704_067_200_000, plate, color)
                    .with_model("Toyota Camry")
                    .with_source("gate-1");
                classifier.classify(match_detection(detection, &snapshot))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_jsonl_sink_writes_access_log_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("access_logs.jsonl");
        let sink = JsonlSink::new(&path);

        for event in classified(&[("ABC1234", "Red"), ("ABC1234", "Blue")]) {
            sink.append(&event).await.unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(content.ends_with('\n'));

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["seq"], 1);
        assert_eq!(first["plate_number"], "ABC1234");
        assert_eq!(first["detected_color"], "Red");
        assert_eq!(first["classification"], "VALID");
        assert_eq!(first["timestamp"], "2024-01-01T00:00:00.000Z");
        assert_eq!(first["source"], "gate-1");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["reason"], "COLOR_MISMATCH");
        assert_eq!(second["color_matched"], false);
    }

    #[tokio::test]
    async fn test_last_sequence_recovers_highest_seq() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access_logs.jsonl");
        let sink = JsonlSink::new(&path);
        assert_eq!(sink.last_sequence(), Seq::ZERO);

        for event in classified(&[("ABC1234", "Red"), ("XYZ9999", "Red"), ("ABC1234", "Red")]) {
            sink.append(&event).await.unwrap();
        }
        // A torn trailing line is ignored
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("{\"seq\":");
        fs::write(&path, content).unwrap();

        assert_eq!(sink.last_sequence(), Seq(3));
    }

    #[tokio::test]
    async fn test_jsonl_sink_reopens_after_failed_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access_logs.jsonl");
        // A directory in the file's place makes the open fail
        fs::create_dir(&path).unwrap();
        let sink = JsonlSink::new(&path);
        let events = classified(&[("ABC1234", "Red"), ("ABC1234", "Red")]);

        assert!(matches!(sink.append(&events[0]).await, Err(EngineError::PersistFailure(_))));

        fs::remove_dir(&path).unwrap();
        sink.append(&events[0]).await.unwrap();
        sink.append(&events[1]).await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(sink.last_sequence(), Seq(2));
    }

    #[test]
    fn test_http_sink_endpoint() {
        let sink = HttpSink::new("https://store.example", "access_logs", None).unwrap();
        assert_eq!(sink.endpoint(), "https://store.example/rest/v1/access_logs");
    }

    #[tokio::test]
    async fn test_memory_sink_failure_toggle() {
        let sink = MemorySink::new();
        let events = classified(&[("ABC1234", "Red")]);

        sink.set_failing(true);
        assert!(matches!(sink.append(&events[0]).await, Err(EngineError::PersistFailure(_))));
        assert!(sink.is_empty());

        sink.set_failing(false);
        sink.append(&events[0]).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.rows()[0].seq, 1);
    }
}
