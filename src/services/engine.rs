//! Ingestion pipeline and orchestration
//!
//! The Engine is the central event processor that coordinates:
//! - Matching (lock-free against the current registry snapshot)
//! - Classification and sequence assignment
//! - Aggregation
//! - Fan-out to subscribers and hand-off to persistence
//!
//! Everything after matching runs under one mutex, so sequence order,
//! aggregate order, dispatch order and persist order are the same order.
//! Lock order is sequencer, then dispatcher.

use crate::domain::access_log::ClassifiedEvent;
use crate::domain::detection::parse_detections;
use crate::domain::error::{EngineError, EngineResult};
use crate::domain::types::{epoch_ms, DetectionEvent, Seq};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::{AggregateBucket, Aggregator};
use crate::services::classifier::{decide, Classifier};
use crate::services::dispatcher::{Dispatcher, SubscriberInfo, Subscription};
use crate::services::matcher::{match_detection, Matcher};
use crate::services::registry::{Registry, RegistryStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Minimum spacing between malformed-input warnings
const MALFORMED_WARN_INTERVAL_MS: u64 = 1000;

/// Tunables for the pipeline
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bucket_width_ms: u64,
    pub queue_capacity: usize,
    pub log_retention: usize,
    pub drain_grace: Duration,
    /// Last sequence issued by a previous run
    pub start_after: Seq,
}

impl EngineSettings {
    pub fn from_config(config: &Config, start_after: Seq) -> Self {
        Self {
            bucket_width_ms: config.bucket_width_ms(),
            queue_capacity: config.queue_capacity(),
            log_retention: config.log_retention(),
            drain_grace: config.drain_grace(),
            start_after,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default(), Seq::ZERO)
    }
}

/// State owned by the serialization point
struct Sequencer {
    classifier: Classifier,
    aggregator: Aggregator,
}

/// Health summary served on /health and egress
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub registry: RegistryStatus,
    pub persist_unhealthy: bool,
    pub persist_backlog: u64,
    pub head_seq: Seq,
    pub retained_events: usize,
    pub subscribers: Vec<SubscriberInfo>,
}

pub struct Engine {
    registry: Arc<Registry>,
    matcher: Matcher,
    sequencer: Mutex<Sequencer>,
    dispatcher: Arc<Dispatcher>,
    persist_tx: Option<mpsc::UnboundedSender<Arc<ClassifiedEvent>>>,
    metrics: Arc<Metrics>,
    last_malformed_warn_ms: AtomicU64,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        registry: Arc<Registry>,
        persist_tx: Option<mpsc::UnboundedSender<Arc<ClassifiedEvent>>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(
            settings.queue_capacity,
            settings.log_retention,
            settings.drain_grace,
            settings.start_after,
            metrics.clone(),
        ));
        Arc::new(Self {
            matcher: Matcher::new(registry.clone()),
            registry,
            sequencer: Mutex::new(Sequencer {
                classifier: Classifier::starting_after(settings.start_after),
                aggregator: Aggregator::new(settings.bucket_width_ms),
            }),
            dispatcher,
            persist_tx,
            metrics,
            last_malformed_warn_ms: AtomicU64::new(0),
        })
    }

    /// Parse and ingest one payload (object or array). Malformed elements
    /// are rejected individually and never reach the matcher.
    pub fn ingest_json(&self, payload: &str) -> Vec<EngineResult<Arc<ClassifiedEvent>>> {
        parse_detections(payload)
            .into_iter()
            .map(|parsed| match parsed {
                Ok(detection) => Ok(self.ingest(detection)),
                Err(e) => {
                    self.reject(&e);
                    Err(e)
                }
            })
            .collect()
    }

    /// Match, classify, absorb, dispatch and enqueue for persistence
    pub fn ingest(&self, detection: DetectionEvent) -> Arc<ClassifiedEvent> {
        let start = Instant::now();

        // Matching only needs the immutable snapshot
        let verdict = self.matcher.match_detection(detection);

        let event = {
            let mut seq = self.sequencer.lock();
            let event = Arc::new(seq.classifier.classify(verdict));
            seq.aggregator.absorb(&event);
            self.dispatcher.publish(event.clone());
            if let Some(tx) = &self.persist_tx {
                match tx.send(event.clone()) {
                    Ok(()) => self.metrics.record_persist_enqueued(),
                    Err(_) => {
                        self.metrics.record_persist_failure();
                        warn!(seq = %event.seq, "persist_worker_gone");
                    }
                }
            }
            event
        };

        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_classified(!event.is_suspicious(), event.is_fraud(), latency_us);

        if event.is_suspicious() {
            info!(
                seq = %event.seq,
                plate = %event.verdict.plate,
                color = %event.verdict.detection.color,
                reason = %event.reason.as_str(),
                source = %event.verdict.detection.source,
                "detection_suspicious"
            );
        } else {
            debug!(
                seq = %event.seq,
                plate = %event.verdict.plate,
                latency_us = %latency_us,
                "detection_classified"
            );
        }

        event
    }

    /// Count a rejected detection; warnings are rate-limited
    pub fn reject(&self, error: &EngineError) {
        self.metrics.record_malformed();
        let now = epoch_ms();
        let last = self.last_malformed_warn_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= MALFORMED_WARN_INTERVAL_MS
            && self
                .last_malformed_warn_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                error = %error,
                malformed_total = %self.metrics.malformed_total(),
                "detection_rejected"
            );
        } else {
            debug!(error = %error, "detection_rejected");
        }
    }

    /// Buckets overlapping `[from, to)`
    pub fn query(&self, from: u64, to: u64) -> Vec<AggregateBucket> {
        self.sequencer.lock().aggregator.query(from, to)
    }

    pub fn totals(&self) -> AggregateBucket {
        self.sequencer.lock().aggregator.totals()
    }

    /// Broadcast buckets changed since the last call. Returns how many.
    pub fn publish_aggregate_deltas(&self) -> usize {
        let mut seq = self.sequencer.lock();
        let changed = seq.aggregator.take_dirty();
        for bucket in &changed {
            self.dispatcher.broadcast_aggregate(*bucket);
        }
        changed.len()
    }

    /// Recount buckets by re-evaluating every retained detection against the
    /// current registry snapshot. The event log itself is never rewritten.
    /// Skipped (returns false) once the log no longer holds every event.
    pub fn recompute_aggregates(&self) -> bool {
        let mut seq = self.sequencer.lock();
        let Some(history) = self.dispatcher.complete_history() else {
            warn!(
                retained = %self.dispatcher.retained(),
                "aggregate_recompute_skipped_history_incomplete"
            );
            return false;
        };

        let snapshot = self.registry.snapshot();
        seq.aggregator.rebuild(history.iter().map(|event| {
            let verdict = match_detection(event.verdict.detection.clone(), &snapshot);
            let (classification, reason) = decide(&verdict);
            (event.ts(), classification, reason)
        }));

        let changed = seq.aggregator.take_dirty();
        for bucket in &changed {
            self.dispatcher.broadcast_aggregate(*bucket);
        }
        info!(
            events = %history.len(),
            buckets = %changed.len(),
            registry_version = %snapshot.version(),
            "aggregates_recomputed"
        );
        true
    }

    pub fn subscribe(&self, last_seen: Option<Seq>, label: &str) -> Subscription {
        self.dispatcher.subscribe(last_seen, label)
    }

    pub fn last_seq(&self) -> Seq {
        self.sequencer.lock().classifier.last_assigned()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Degraded when the registry is stale or persistence is failing
    pub fn health(&self) -> HealthReport {
        let registry = self.registry.status();
        let persist_unhealthy = self.metrics.persist_unhealthy();
        HealthReport {
            healthy: !registry.stale && !persist_unhealthy,
            registry,
            persist_unhealthy,
            persist_backlog: self.metrics.persist_backlog(),
            head_seq: self.dispatcher.head(),
            retained_events: self.dispatcher.retained(),
            subscribers: self.dispatcher.subscribers(),
        }
    }

    /// Consume raw detection payloads until the channel closes or shutdown,
    /// broadcasting aggregate deltas on `delta_interval`
    pub async fn run(
        self: Arc<Self>,
        mut payload_rx: mpsc::Receiver<String>,
        delta_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut delta_tick = interval(delta_interval);
        info!(last_seq = %self.last_seq(), "engine_started");

        loop {
            tokio::select! {
                payload = payload_rx.recv() => {
                    match payload {
                        Some(p) => {
                            self.ingest_json(&p);
                        }
                        None => break,
                    }
                }
                _ = delta_tick.tick() => {
                    self.publish_aggregate_deltas();
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Flush whatever changed since the last tick
        self.publish_aggregate_deltas();
        info!(last_seq = %self.last_seq(), "engine_stopped");
    }

    /// Recompute aggregates after every registry reload until shutdown
    pub async fn run_recompute_on_reload(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut reloads = self.registry.subscribe_reloads();
        loop {
            tokio::select! {
                changed = reloads.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.recompute_aggregates();
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
