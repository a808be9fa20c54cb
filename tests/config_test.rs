//! Integration tests for configuration loading

use access_engine::infra::{Config, RegistrySourceKind, SinkKind};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "north-gate"

[mqtt]
host = "broker.local"
port = 1884
username = "engine"
password = "secret"
detections_topic = "site/north/detections"
registry_topic = "site/north/registry"

[registry]
source = "http"
url = "https://store.example"
table = "vehicles"
api_key = "anon-key"
refresh_interval_secs = 30
fetch_timeout_ms = 2500

[persistence]
sink = "http"
url = "https://store.example"
table = "access_logs"
retry_initial_ms = 50
retry_max_ms = 2000
unhealthy_after = 3

[aggregation]
bucket_width_secs = 3600
delta_interval_ms = 500
recompute_on_reload = true

[dispatcher]
queue_capacity = 64
drain_grace_ms = 1500
log_retention = 5000
pump_interval_ms = 20
listener_enabled = false
listener_port = 7500

[metrics]
interval_secs = 15
http_port = 9191

[mqtt_egress]
enabled = true
alerts_topic = "site/north/alerts"
health_interval_secs = 10
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "north-gate");
    assert_eq!(config.mqtt_host(), "broker.local");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_username(), Some("engine"));
    assert_eq!(config.detections_topic(), "site/north/detections");
    assert_eq!(config.registry_topic(), "site/north/registry");

    assert_eq!(config.registry_source(), RegistrySourceKind::Http);
    assert_eq!(config.registry_url(), "https://store.example");
    assert_eq!(config.registry_api_key(), Some("anon-key"));
    assert_eq!(config.registry_refresh_interval(), Duration::from_secs(30));
    assert_eq!(config.registry_fetch_timeout(), Duration::from_millis(2500));

    assert_eq!(config.sink(), SinkKind::Http);
    assert_eq!(config.persist_table(), "access_logs");
    assert_eq!(config.retry_initial(), Duration::from_millis(50));
    assert_eq!(config.retry_max(), Duration::from_millis(2000));
    assert_eq!(config.unhealthy_after(), 3);

    assert_eq!(config.bucket_width_ms(), 3_600_000);
    assert_eq!(config.delta_interval(), Duration::from_millis(500));
    assert!(config.recompute_on_reload());

    assert_eq!(config.queue_capacity(), 64);
    assert_eq!(config.drain_grace(), Duration::from_millis(1500));
    assert_eq!(config.log_retention(), 5000);
    assert!(!config.listener_enabled());
    assert_eq!(config.listener_port(), 7500);

    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.http_port(), 9191);

    assert!(config.mqtt_egress_enabled());
    assert_eq!(config.mqtt_egress_alerts_topic(), "site/north/alerts");
    // Unset topics keep their defaults
    assert_eq!(config.mqtt_egress_events_topic(), "access/events");
    assert_eq!(config.mqtt_egress_health_interval_secs(), 10);
}

#[test]
fn test_partial_config_uses_section_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[registry]\nfile = \"data/cars.json\"\n").unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.registry_source(), RegistrySourceKind::File);
    assert_eq!(config.registry_file(), "data/cars.json");
    assert_eq!(config.sink(), SinkKind::Jsonl);
    assert_eq!(config.bucket_width_ms(), 86_400_000);
    assert_eq!(config.queue_capacity(), 256);
}

#[test]
fn test_invalid_enum_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[persistence]\nsink = \"carrier-pigeon\"\n").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.registry_source(), RegistrySourceKind::File);
    assert_eq!(config.sink(), SinkKind::Jsonl);
    assert!(!config.mqtt_egress_enabled());
}

#[test]
fn test_resolve_config_path_prefers_explicit() {
    assert_eq!(Config::resolve_config_path(Some("custom.toml")), "custom.toml");
}
