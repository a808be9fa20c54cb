//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for detections and registry change notifications
//! - `mqtt_egress` - MQTT publisher for classified events, alerts and health
//! - `registry_source` - File and HTTP sources for the vehicle registry
//! - `sink` - Access-log sinks (JSONL file, HTTP store)
//! - `subscriber_listener` - TCP line protocol for live subscribers
//! - `http` - Metrics, health and query HTTP endpoint

pub mod http;
pub mod mqtt;
pub mod mqtt_egress;
pub mod registry_source;
pub mod sink;
pub mod subscriber_listener;

// Re-export commonly used types
pub use http::{start_http_server, HttpState};
pub use mqtt_egress::MqttEgress;
pub use registry_source::{FileRegistrySource, HttpRegistrySource, InMemoryRegistrySource};
pub use sink::{HttpSink, JsonlSink, MemorySink};
pub use subscriber_listener::start_subscriber_listener;
