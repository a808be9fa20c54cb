//! MQTT egress observer
//!
//! A built-in dispatcher subscriber that republishes the classified-event
//! stream for downstream consumers:
//! - events topic - every classified event (QoS 1)
//! - alerts topic - suspicious events only (QoS 1)
//! - aggregates topic - aggregate bucket deltas (QoS 0)
//! - health topic - periodic health report (QoS 0)

use crate::domain::types::Seq;
use crate::infra::config::Config;
use crate::services::dispatcher::{Delivery, Subscription};
use crate::services::engine::Engine;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SUBSCRIBER_LABEL: &str = "mqtt-egress";

/// One message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub qos: QoS,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct EgressTopics {
    pub events: String,
    pub alerts: String,
    pub aggregates: String,
    pub health: String,
}

impl EgressTopics {
    pub fn from_config(config: &Config) -> Self {
        Self {
            events: config.mqtt_egress_events_topic().to_string(),
            alerts: config.mqtt_egress_alerts_topic().to_string(),
            aggregates: config.mqtt_egress_aggregates_topic().to_string(),
            health: config.mqtt_egress_health_topic().to_string(),
        }
    }

    /// Messages for one delivery; markers produce nothing
    pub fn route(&self, delivery: &Delivery) -> Vec<Outbound> {
        match delivery {
            Delivery::Event(event) => {
                let payload = event.to_json();
                let mut out = Vec::with_capacity(2);
                if event.is_suspicious() {
                    out.push(Outbound {
                        topic: self.alerts.clone(),
                        qos: QoS::AtLeastOnce,
                        payload: payload.clone(),
                    });
                }
                out.push(Outbound { topic: self.events.clone(), qos: QoS::AtLeastOnce, payload });
                out
            }
            Delivery::Aggregate(bucket) => match serde_json::to_string(bucket) {
                Ok(payload) => {
                    vec![Outbound { topic: self.aggregates.clone(), qos: QoS::AtMostOnce, payload }]
                }
                Err(_) => Vec::new(),
            },
            Delivery::CaughtUp { .. } | Delivery::Gap { .. } => Vec::new(),
        }
    }
}

/// MQTT publisher actor fed by its own dispatcher subscription
pub struct MqttEgress {
    client: AsyncClient,
    engine: Arc<Engine>,
    topics: EgressTopics,
    health_interval: Duration,
    last_published: Seq,
}

impl MqttEgress {
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, engine: Arc<Engine>) -> Self {
        let client_id = format!("{}-egress-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn the eventloop handler
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            engine,
            topics: EgressTopics::from_config(config),
            health_interval: Duration::from_secs(config.mqtt_egress_health_interval_secs().max(1)),
            last_published: Seq::ZERO,
        }
    }

    /// Run the publisher loop until shutdown. When the dispatcher closes the
    /// subscription, it resubscribes from the last published sequence.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            events = %self.topics.events,
            alerts = %self.topics.alerts,
            aggregates = %self.topics.aggregates,
            health = %self.topics.health,
            "mqtt_egress_started"
        );

        let mut sub = self.engine.subscribe(None, SUBSCRIBER_LABEL);
        let mut health_tick = interval(self.health_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                delivery = sub.recv() => {
                    match delivery {
                        Some(delivery) => self.handle(&sub, delivery).await,
                        None => {
                            warn!(last_seq = %self.last_published, "mqtt_egress_resubscribing");
                            sub = self.engine.subscribe(Some(self.last_published), SUBSCRIBER_LABEL);
                        }
                    }
                }
                _ = health_tick.tick() => {
                    self.publish_health().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        // Drain what is already queued
                        while let Some(delivery) = sub.try_recv() {
                            self.handle(&sub, delivery).await;
                        }
                        info!(last_seq = %self.last_published, "mqtt_egress_shutdown");
                        return;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, sub: &Subscription, delivery: Delivery) {
        match &delivery {
            Delivery::CaughtUp { last_seq } => {
                debug!(last_seq = %last_seq, "mqtt_egress_caught_up");
            }
            Delivery::Gap { from, to } => {
                warn!(from = %from, to = %to, "mqtt_egress_gap");
            }
            _ => {}
        }

        for out in self.topics.route(&delivery) {
            if let Err(e) =
                self.client.publish(out.topic.as_str(), out.qos, false, out.payload.into_bytes()).await
            {
                error!(error = %e, topic = %out.topic, "mqtt_egress_publish_failed");
            }
        }

        self.last_published = resume_point(self.last_published, &delivery);
        if let Delivery::Event(event) = &delivery {
            sub.ack(event.seq);
        }
    }

    async fn publish_health(&self) {
        let health = self.engine.health();
        match serde_json::to_string(&health) {
            Ok(json) => {
                if let Err(e) = self
                    .client
                    .publish(self.topics.health.as_str(), QoS::AtMostOnce, false, json.into_bytes())
                    .await
                {
                    debug!(error = %e, "mqtt_egress_health_failed");
                }
            }
            Err(e) => debug!(error = %e, "mqtt_egress_health_encode_failed"),
        }
    }
}

/// Sequence to resubscribe from after `delivery` is handled. A catch-up
/// marker covers everything up to its `last_seq`, so a subscription that
/// started "from now" never replays history it was not asked for.
fn resume_point(current: Seq, delivery: &Delivery) -> Seq {
    match delivery {
        Delivery::Event(event) => current.max(event.seq),
        Delivery::CaughtUp { last_seq } => current.max(*last_seq),
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DetectionEvent, VehicleRecord};
    use crate::services::aggregator::AggregateBucket;
    use crate::services::classifier::Classifier;
    use crate::services::matcher::match_detection;
    use crate::services::registry::RegistrySnapshot;

    fn topics() -> EgressTopics {
        EgressTopics::from_config(&Config::default())
    }

    fn delivery(plate: &str, color: &str) -> Delivery {
        let snapshot = RegistrySnapshot::from_records(
            vec![VehicleRecord::new("ABC1234", "Toyota Camry", "Red")],
            1,
        );
        let event = Classifier::new()
            .classify(match_detection(DetectionEvent::new(1, plate, color), &snapshot));
        Delivery::Event(Arc::new(event))
    }

    #[test]
    fn test_valid_event_goes_to_events_only() {
        let out = topics().route(&delivery("ABC1234", "Red"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "access/events");
        assert_eq!(out[0].qos, QoS::AtLeastOnce);
        assert!(out[0].payload.contains("\"VALID\""));
    }

    #[test]
    fn test_suspicious_event_also_alerts() {
        let out = topics().route(&delivery("XYZ9999", "Red"));
        let topics: Vec<&str> = out.iter().map(|o| o.topic.as_str()).collect();
        assert_eq!(topics, vec!["access/alerts", "access/events"]);
    }

    #[test]
    fn test_aggregate_and_markers() {
        let bucket = AggregateBucket { window_start: 0, window_ms: 1000, total: 3, ..Default::default() };
        let out = topics().route(&Delivery::Aggregate(bucket));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "access/aggregates");
        assert_eq!(out[0].qos, QoS::AtMostOnce);

        assert!(topics().route(&Delivery::CaughtUp { last_seq: Seq(4) }).is_empty());
        assert!(topics().route(&Delivery::Gap { from: Seq(1), to: Seq(3) }).is_empty());
    }

    #[test]
    fn test_resume_point_follows_catch_up_and_events() {
        let caught_up = resume_point(Seq::ZERO, &Delivery::CaughtUp { last_seq: Seq(5) });
        assert_eq!(caught_up, Seq(5));
        assert_eq!(resume_point(Seq(5), &Delivery::CaughtUp { last_seq: Seq(3) }), Seq(5));
        assert_eq!(resume_point(Seq(5), &Delivery::Gap { from: Seq(6), to: Seq(9) }), Seq(5));
        assert_eq!(resume_point(Seq::ZERO, &delivery("ABC1234", "Red")), Seq(1));
    }
}
