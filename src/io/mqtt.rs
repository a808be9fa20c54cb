//! MQTT client for detection ingestion and registry change notifications

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::registry::RefreshTrigger;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// What an incoming publish is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    Detection,
    RegistryChanged,
    Ignored,
}

/// MQTT topic filter match with `+` (one level) and `#` (remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn route_topic(topic: &str, detections_filter: &str, registry_filter: &str) -> InboundRoute {
    if topic_matches(registry_filter, topic) {
        InboundRoute::RegistryChanged
    } else if topic_matches(detections_filter, topic) {
        InboundRoute::Detection
    } else {
        InboundRoute::Ignored
    }
}

/// Start the MQTT client and forward detection payloads to the engine
///
/// Payloads are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped payloads are counted in metrics and logged (rate-limited).
/// Any message on the registry topic invalidates the registry snapshot.
pub async fn start_mqtt_client(
    config: &Config,
    payload_tx: mpsc::Sender<String>,
    refresh: Option<RefreshTrigger>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("{}-ingest", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let detections_topic = config.detections_topic().to_string();
    let registry_topic = config.registry_topic().to_string();

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(&detections_topic, QoS::AtLeastOnce).await?;
    if refresh.is_some() {
        client.subscribe(&registry_topic, QoS::AtLeastOnce).await?;
    }

    info!(
        detections = %detections_topic,
        registry = %registry_topic,
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_client_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match route_topic(&publish.topic, &detections_topic, &registry_topic) {
                            InboundRoute::RegistryChanged => {
                                if let Some(trigger) = &refresh {
                                    debug!(topic = %publish.topic, "registry_change_notified");
                                    trigger.invalidate();
                                }
                            }
                            InboundRoute::Detection => {
                                let payload = match std::str::from_utf8(&publish.payload) {
                                    Ok(s) => s.to_string(),
                                    Err(e) => {
                                        metrics.record_mqtt_message_dropped();
                                        warn!(error = %e, topic = %publish.topic, "mqtt_payload_not_utf8");
                                        continue;
                                    }
                                };
                                match payload_tx.try_send(payload) {
                                    Ok(()) => {}
                                    Err(TrySendError::Full(_)) => {
                                        metrics.record_mqtt_message_dropped();
                                        if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                            warn!("mqtt_detection_dropped: channel full");
                                            last_drop_warn = Instant::now();
                                        }
                                    }
                                    Err(TrySendError::Closed(_)) => {
                                        warn!("detection_channel_closed");
                                        return Ok(());
                                    }
                                }
                            }
                            InboundRoute::Ignored => {
                                debug!(topic = %publish.topic, "mqtt_message_ignored");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
