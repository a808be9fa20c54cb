//! Persistence worker - writes classified events off the hot path
//!
//! The engine hands each event to this worker over an unbounded channel and
//! moves on; classification and live dispatch never wait on the sink. The
//! worker retries a failing write with exponential backoff until it lands,
//! so a sink outage delays persistence but never drops an event. Sustained
//! failure flips the persist health flag.

use crate::domain::access_log::ClassifiedEvent;
use crate::domain::error::EngineResult;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Append-only store for classified events
#[async_trait]
pub trait PersistSink: Send + Sync {
    async fn append(&self, event: &ClassifiedEvent) -> EngineResult<()>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Exponential backoff between attempts on the same event
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures before the sink is reported unhealthy
    pub unhealthy_after: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): initial * 2^attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            unhealthy_after: 5,
        }
    }
}

/// Worker that drains the persist channel into a sink
pub struct PersistWorker {
    sink: Arc<dyn PersistSink>,
    event_rx: mpsc::UnboundedReceiver<Arc<ClassifiedEvent>>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
    consecutive_failures: u32,
}

impl PersistWorker {
    pub fn new(
        sink: Arc<dyn PersistSink>,
        event_rx: mpsc::UnboundedReceiver<Arc<ClassifiedEvent>>,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { sink, event_rx, policy, metrics, consecutive_failures: 0 }
    }

    /// Run until the channel closes or shutdown is signalled. On shutdown,
    /// the event whose retries were cut short and every event still queued
    /// get one final attempt each, in sequence order.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(sink = %self.sink.name(), "persist_worker_started");

        let mut interrupted = None;
        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => {
                            interrupted = self.persist(event, &mut shutdown).await;
                            if interrupted.is_some() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let mut flushed = 0usize;
        if let Some(event) = interrupted {
            if self.attempt(&event).await {
                flushed += 1;
            }
        }
        while let Ok(event) = self.event_rx.try_recv() {
            if self.attempt(&event).await {
                flushed += 1;
            }
        }

        info!(
            sink = %self.sink.name(),
            flushed = %flushed,
            backlog = %self.metrics.persist_backlog(),
            "persist_worker_stopped"
        );
    }

    /// Write one event, retrying until it succeeds. Hands the event back
    /// unwritten when shutdown interrupts the retries.
    async fn persist(
        &mut self,
        event: Arc<ClassifiedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Arc<ClassifiedEvent>> {
        let mut retry = 0u32;
        loop {
            if self.attempt(&event).await {
                return None;
            }

            let delay = self.policy.delay_for(retry);
            retry = retry.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        warn!(seq = %event.seq, "persist_retry_interrupted_by_shutdown");
                        return Some(event);
                    }
                }
            }
        }
    }

    /// One write attempt with metrics and health bookkeeping
    async fn attempt(&mut self, event: &ClassifiedEvent) -> bool {
        let start = Instant::now();
        match self.sink.append(event).await {
            Ok(()) => {
                let latency_us = start.elapsed().as_micros() as u64;
                self.metrics.record_persisted(latency_us);
                if self.consecutive_failures >= self.policy.unhealthy_after {
                    info!(
                        sink = %self.sink.name(),
                        failures = %self.consecutive_failures,
                        "persist_recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.metrics.set_persist_unhealthy(false);
                debug!(seq = %event.seq, latency_us = %latency_us, "event_persisted");
                true
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.metrics.record_persist_failure();
                if self.consecutive_failures == self.policy.unhealthy_after {
                    self.metrics.set_persist_unhealthy(true);
                    error!(
                        sink = %self.sink.name(),
                        seq = %event.seq,
                        failures = %self.consecutive_failures,
                        error = %e,
                        "persist_unhealthy"
                    );
                } else {
                    warn!(
                        sink = %self.sink.name(),
                        seq = %event.seq,
                        failures = %self.consecutive_failures,
                        error = %e,
                        "persist_failed"
                    );
                }
                false
            }
        }
    }
}

/// Create the persist channel and worker
///
/// Returns the sender (for the engine) and the worker (to be spawned)
pub fn create_persist_worker(
    sink: Arc<dyn PersistSink>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
) -> (mpsc::UnboundedSender<Arc<ClassifiedEvent>>, PersistWorker) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let worker = PersistWorker::new(sink, event_rx, policy, metrics);
    (event_tx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::EngineError;
    use crate::domain::types::{DetectionEvent, VehicleRecord};
    use crate::services::classifier::Classifier;
    use crate::services::matcher::match_detection;
    use crate::services::registry::RegistrySnapshot;
    use parking_lot::Mutex;

    /// Fails the first `fail_first` appends, then records sequences
    struct FlakySink {
        fail_first: Mutex<u32>,
        written: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl PersistSink for FlakySink {
        async fn append(&self, event: &ClassifiedEvent) -> EngineResult<()> {
            {
                let mut remaining = self.fail_first.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::PersistFailure("store offline".to_string()));
                }
            }
            self.written.lock().push(event.seq.0);
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn event(classifier: &mut Classifier) -> Arc<ClassifiedEvent> {
        let snapshot = RegistrySnapshot::from_records(vec![VehicleRecord::new("A1", "M", "Red")], 1);
        Arc::new(classifier.classify(match_detection(DetectionEvent::new(1, "A1", "Red"), &snapshot)))
    }

    fn fast_policy(unhealthy_after: u32) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            unhealthy_after,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            unhealthy_after: 3,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retries_until_written_in_order() {
        let sink = Arc::new(FlakySink { fail_first: Mutex::new(3), written: Mutex::new(Vec::new()) });
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_persist_worker(sink.clone(), fast_policy(10), metrics.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut classifier = Classifier::new();
        for _ in 0..3 {
            metrics.record_persist_enqueued();
            tx.send(event(&mut classifier)).unwrap();
        }
        drop(tx);
        worker.run(shutdown_rx).await;

        assert_eq!(*sink.written.lock(), vec![1, 2, 3]);
        let summary = metrics.snapshot();
        assert_eq!(summary.persisted_total, 3);
        assert_eq!(summary.persist_failures_total, 3);
        assert_eq!(summary.persist_backlog, 0);
        assert!(!summary.persist_unhealthy);
    }

    #[tokio::test]
    async fn test_sustained_failure_flags_unhealthy() {
        let sink =
            Arc::new(FlakySink { fail_first: Mutex::new(u32::MAX), written: Mutex::new(Vec::new()) });
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_persist_worker(sink.clone(), fast_policy(2), metrics.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        let mut classifier = Classifier::new();
        tx.send(event(&mut classifier)).unwrap();

        for _ in 0..200 {
            if metrics.persist_unhealthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(metrics.persist_unhealthy());
        assert!(sink.written.lock().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_flushes_pending_event() {
        let sink =
            Arc::new(FlakySink { fail_first: Mutex::new(u32::MAX), written: Mutex::new(Vec::new()) });
        let metrics = Arc::new(Metrics::new());
        let policy = RetryPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(5),
            unhealthy_after: 10,
        };
        let (tx, worker) = create_persist_worker(sink.clone(), policy, metrics.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        let mut classifier = Classifier::new();
        for _ in 0..2 {
            metrics.record_persist_enqueued();
            tx.send(event(&mut classifier)).unwrap();
        }

        // First attempt on seq 1 fails and the worker sits in its backoff
        for _ in 0..200 {
            if metrics.snapshot().persist_failures_total >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(metrics.snapshot().persist_failures_total >= 1);

        *sink.fail_first.lock() = 0;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*sink.written.lock(), vec![1, 2]);
        assert_eq!(metrics.snapshot().persist_backlog, 0);
    }
}
