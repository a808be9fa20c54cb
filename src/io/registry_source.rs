//! Registry sources - where the vehicle table comes from
//!
//! - `FileRegistrySource` reads a JSON array of vehicle rows from disk
//! - `HttpRegistrySource` pulls the `vehicles` table from a PostgREST-style store
//! - `InMemoryRegistrySource` is a mutable table for tests and the replay tool
//!
//! Rows use the store's column names (`plate_number`, `make_model`, `color`,
//! `owner_name`, `created_at`).

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::types::{deserialize_timestamp, Plate, TimestampValue, VehicleRecord};
use crate::infra::config::Config;
use crate::services::registry::RegistrySource;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// One row of the `vehicles` table
#[derive(Debug, Deserialize)]
pub struct VehicleRow {
    #[serde(alias = "plate")]
    pub plate_number: String,
    #[serde(default, alias = "model")]
    pub make_model: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: TimestampValue,
}

impl VehicleRow {
    pub fn into_record(self) -> VehicleRecord {
        VehicleRecord {
            plate: Plate::normalize(&self.plate_number),
            make_model: self.make_model.trim().to_string(),
            color: self.color.trim().to_string(),
            owner_name: self.owner_name.filter(|o| !o.trim().is_empty()),
            registered_at: self.created_at.to_epoch_ms().unwrap_or(0),
        }
    }
}

/// Convert rows, dropping any with an empty plate
fn rows_to_records(rows: Vec<VehicleRow>) -> Vec<VehicleRecord> {
    let total = rows.len();
    let records: Vec<VehicleRecord> = rows
        .into_iter()
        .map(VehicleRow::into_record)
        .filter(|r| !r.plate.is_empty())
        .collect();
    if records.len() < total {
        debug!(skipped = %(total - records.len()), "registry_rows_without_plate_skipped");
    }
    records
}

/// Parse a JSON array of vehicle rows
pub fn parse_vehicle_rows(json: &str) -> EngineResult<Vec<VehicleRecord>> {
    let rows: Vec<VehicleRow> = serde_json::from_str(json)
        .map_err(|e| EngineError::RegistryUnavailable(format!("invalid registry json: {e}")))?;
    Ok(rows_to_records(rows))
}

/// JSON file holding the whole registry
pub struct FileRegistrySource {
    path: PathBuf,
}

impl FileRegistrySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RegistrySource for FileRegistrySource {
    async fn fetch_all_vehicles(&self) -> EngineResult<Vec<VehicleRecord>> {
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::RegistryUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        parse_vehicle_rows(&json)
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// PostgREST-style HTTP source: `GET {url}/rest/v1/{table}?select=*`
pub struct HttpRegistrySource {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRegistrySource {
    pub fn new(base_url: &str, table: &str, api_key: Option<&str>) -> anyhow::Result<Self> {
        // Connection pooling across refreshes
        let client = reqwest::Client::builder()
            .http1_only()
            .build()
            .context("failed to build registry http client")?;
        let endpoint = format!("{}/rest/v1/{}?select=*", base_url.trim_end_matches('/'), table);
        info!(endpoint = %endpoint, "http_registry_source_initialized");
        Ok(Self { client, endpoint, api_key: api_key.map(str::to_string) })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let url = config.registry_url();
        if url.is_empty() {
            anyhow::bail!("registry.url is required when registry.source = \"http\"");
        }
        Self::new(url, config.registry_table(), config.registry_api_key())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RegistrySource for HttpRegistrySource {
    async fn fetch_all_vehicles(&self) -> EngineResult<Vec<VehicleRecord>> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::RegistryUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::RegistryUnavailable(format!("store returned {status}")));
        }

        let rows: Vec<VehicleRow> = response
            .json()
            .await
            .map_err(|e| EngineError::RegistryUnavailable(format!("invalid response body: {e}")))?;
        Ok(rows_to_records(rows))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Mutable in-process registry
#[derive(Default)]
pub struct InMemoryRegistrySource {
    records: Mutex<Vec<VehicleRecord>>,
    unavailable: Mutex<Option<String>>,
}

impl InMemoryRegistrySource {
    pub fn new(records: Vec<VehicleRecord>) -> Self {
        Self { records: Mutex::new(records), unavailable: Mutex::new(None) }
    }

    pub fn set_records(&self, records: Vec<VehicleRecord>) {
        *self.records.lock() = records;
    }

    /// Make subsequent fetches fail with `reason`, or succeed again with `None`
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.lock() = reason.map(str::to_string);
    }
}

#[async_trait]
impl RegistrySource for InMemoryRegistrySource {
    async fn fetch_all_vehicles(&self) -> EngineResult<Vec<VehicleRecord>> {
        if let Some(reason) = self.unavailable.lock().clone() {
            return Err(EngineError::RegistryUnavailable(reason));
        }
        Ok(self.records.lock().clone())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
