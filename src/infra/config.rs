//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrySourceKind {
    File,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Jsonl,
    Http,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, stamped on egress payloads
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "access-engine".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Enable MQTT detection ingestion
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Topic carrying detection JSON (object or array)
    #[serde(default = "default_detections_topic")]
    pub detections_topic: String,
    /// Topic whose messages invalidate the registry snapshot
    #[serde(default = "default_registry_topic")]
    pub registry_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            enabled: true,
            detections_topic: default_detections_topic(),
            registry_topic: default_registry_topic(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_detections_topic() -> String {
    "access/detections".to_string()
}

fn default_registry_topic() -> String {
    "access/registry/changed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_source")]
    pub source: RegistrySourceKind,
    /// JSON array of vehicle rows (file source)
    #[serde(default = "default_registry_file")]
    pub file: String,
    /// Store base URL (http source)
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_vehicles_table")]
    pub table: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source: default_registry_source(),
            file: default_registry_file(),
            url: String::new(),
            table: default_vehicles_table(),
            api_key: None,
            refresh_interval_secs: default_refresh_interval(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

fn default_registry_source() -> RegistrySourceKind {
    RegistrySourceKind::File
}

fn default_registry_file() -> String {
    "config/vehicles.json".to_string()
}

fn default_vehicles_table() -> String {
    "vehicles".to_string()
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_fetch_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_sink")]
    pub sink: SinkKind,
    /// Append-only JSONL file (jsonl sink)
    #[serde(default = "default_persist_file")]
    pub file: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_access_logs_table")]
    pub table: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
    /// Consecutive failures before the sink is reported unhealthy
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sink: default_sink(),
            file: default_persist_file(),
            url: String::new(),
            table: default_access_logs_table(),
            api_key: None,
            retry_initial_ms: default_retry_initial(),
            retry_max_ms: default_retry_max(),
            unhealthy_after: default_unhealthy_after(),
        }
    }
}

fn default_sink() -> SinkKind {
    SinkKind::Jsonl
}

fn default_persist_file() -> String {
    "access_logs.jsonl".to_string()
}

fn default_access_logs_table() -> String {
    "access_logs".to_string()
}

fn default_retry_initial() -> u64 {
    100
}

fn default_retry_max() -> u64 {
    10_000
}

fn default_unhealthy_after() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Bucket width (default one day)
    #[serde(default = "default_bucket_width")]
    pub bucket_width_secs: u64,
    /// Interval between aggregate delta broadcasts
    #[serde(default = "default_delta_interval")]
    pub delta_interval_ms: u64,
    /// Rebuild buckets from the retained log after each registry reload
    #[serde(default)]
    pub recompute_on_reload: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: default_bucket_width(),
            delta_interval_ms: default_delta_interval(),
            recompute_on_reload: false,
        }
    }
}

fn default_bucket_width() -> u64 {
    86_400
}

fn default_delta_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Bounded per-subscriber delivery queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Time a draining subscriber has to catch up before it is closed
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,
    /// Classified events kept in memory for resumption
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
    #[serde(default = "default_pump_interval")]
    pub pump_interval_ms: u64,
    #[serde(default = "default_true")]
    pub listener_enabled: bool,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_grace_ms: default_drain_grace(),
            log_retention: default_log_retention(),
            pump_interval_ms: default_pump_interval(),
            listener_enabled: true,
            listener_port: default_listener_port(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_drain_grace() -> u64 {
    5000
}

fn default_log_retention() -> usize {
    100_000
}

fn default_pump_interval() -> u64 {
    50
}

fn default_listener_port() -> u16 {
    7420
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Metrics/health/API HTTP port (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), http_port: default_http_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_http_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Topic for every classified event (QoS 1)
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    /// Topic for suspicious events only (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    /// Topic for aggregate deltas (QoS 0)
    #[serde(default = "default_aggregates_topic")]
    pub aggregates_topic: String,
    /// Topic for periodic health snapshots (QoS 0)
    #[serde(default = "default_health_topic")]
    pub health_topic: String,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            events_topic: default_events_topic(),
            alerts_topic: default_alerts_topic(),
            aggregates_topic: default_aggregates_topic(),
            health_topic: default_health_topic(),
            health_interval_secs: default_health_interval(),
        }
    }
}

fn default_events_topic() -> String {
    "access/events".to_string()
}

fn default_alerts_topic() -> String {
    "access/alerts".to_string()
}

fn default_aggregates_topic() -> String {
    "access/aggregates".to_string()
}

fn default_health_topic() -> String {
    "access/health".to_string()
}

fn default_health_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    config_file: String,
    mqtt: MqttConfig,
    registry: RegistryConfig,
    persistence: PersistenceConfig,
    aggregation: AggregationConfig,
    dispatcher: DispatcherConfig,
    metrics: MetricsConfig,
    mqtt_egress: MqttEgressConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            config_file,
            mqtt: toml_config.mqtt,
            registry: toml_config.registry,
            persistence: toml_config.persistence,
            aggregation: toml_config.aggregation,
            dispatcher: toml_config.dispatcher,
            metrics: toml_config.metrics,
            mqtt_egress: toml_config.mqtt_egress,
        }
    }

    /// Determine config file path: explicit path, then CONFIG_FILE, then dev.toml
    pub fn resolve_config_path(explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // MQTT ingestion
    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt.enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn detections_topic(&self) -> &str {
        &self.mqtt.detections_topic
    }

    pub fn registry_topic(&self) -> &str {
        &self.mqtt.registry_topic
    }

    // Registry
    pub fn registry_source(&self) -> RegistrySourceKind {
        self.registry.source
    }

    pub fn registry_file(&self) -> &str {
        &self.registry.file
    }

    pub fn registry_url(&self) -> &str {
        &self.registry.url
    }

    pub fn registry_table(&self) -> &str {
        &self.registry.table
    }

    pub fn registry_api_key(&self) -> Option<&str> {
        self.registry.api_key.as_deref()
    }

    pub fn registry_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.registry.refresh_interval_secs.max(1))
    }

    pub fn registry_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.fetch_timeout_ms)
    }

    // Persistence
    pub fn sink(&self) -> SinkKind {
        self.persistence.sink
    }

    pub fn persist_file(&self) -> &str {
        &self.persistence.file
    }

    pub fn persist_url(&self) -> &str {
        &self.persistence.url
    }

    pub fn persist_table(&self) -> &str {
        &self.persistence.table
    }

    pub fn persist_api_key(&self) -> Option<&str> {
        self.persistence.api_key.as_deref()
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.persistence.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.persistence.retry_max_ms)
    }

    pub fn unhealthy_after(&self) -> u32 {
        self.persistence.unhealthy_after
    }

    // Aggregation
    pub fn bucket_width_ms(&self) -> u64 {
        self.aggregation.bucket_width_secs.max(1) * 1000
    }

    pub fn delta_interval(&self) -> Duration {
        Duration::from_millis(self.aggregation.delta_interval_ms.max(1))
    }

    pub fn recompute_on_reload(&self) -> bool {
        self.aggregation.recompute_on_reload
    }

    // Dispatcher
    pub fn queue_capacity(&self) -> usize {
        self.dispatcher.queue_capacity.max(1)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.dispatcher.drain_grace_ms)
    }

    pub fn log_retention(&self) -> usize {
        self.dispatcher.log_retention.max(1)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.pump_interval_ms.max(1))
    }

    pub fn listener_enabled(&self) -> bool {
        self.dispatcher.listener_enabled
    }

    pub fn listener_port(&self) -> u16 {
        self.dispatcher.listener_port
    }

    // Metrics
    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs.max(1)
    }

    pub fn http_port(&self) -> u16 {
        self.metrics.http_port
    }

    // MQTT egress
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress.enabled
    }

    pub fn mqtt_egress_events_topic(&self) -> &str {
        &self.mqtt_egress.events_topic
    }

    pub fn mqtt_egress_alerts_topic(&self) -> &str {
        &self.mqtt_egress.alerts_topic
    }

    pub fn mqtt_egress_aggregates_topic(&self) -> &str {
        &self.mqtt_egress.aggregates_topic
    }

    pub fn mqtt_egress_health_topic(&self) -> &str {
        &self.mqtt_egress.health_topic
    }

    pub fn mqtt_egress_health_interval_secs(&self) -> u64 {
        self.mqtt_egress.health_interval_secs.max(1)
    }

    /// Builder for tests and tools that run without a file
    pub fn with_registry_file(mut self, path: &str) -> Self {
        self.registry.source = RegistrySourceKind::File;
        self.registry.file = path.to_string();
        self
    }

    /// Builder for tests and tools that run without a file
    pub fn with_persist_file(mut self, path: &str) -> Self {
        self.persistence.sink = SinkKind::Jsonl;
        self.persistence.file = path.to_string();
        self
    }

    #[cfg(test)]
    pub fn with_dispatcher(mut self, queue_capacity: usize, drain_grace_ms: u64) -> Self {
        self.dispatcher.queue_capacity = queue_capacity;
        self.dispatcher.drain_grace_ms = drain_grace_ms;
        self
    }
}
