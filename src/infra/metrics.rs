//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that resets anything (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Latency histogram: cumulative buckets plus a running sum and max
struct Histogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.max_us, latency_us);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let buckets = load_buckets(&self.buckets);
        let count: u64 = buckets.iter().sum();
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets,
            count,
            sum_us,
            avg_us: if count > 0 { sum_us / count } else { 0 },
            max_us: self.max_us.load(Ordering::Relaxed),
            p50_us: percentile_from_buckets(&buckets, 0.50),
            p95_us: percentile_from_buckets(&buckets, 0.95),
            p99_us: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HistogramSnapshot {
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub buckets: [u64; NUM_BUCKETS],
    pub count: u64,
    pub sum_us: u64,
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics. Histograms are
/// cumulative (Prometheus semantics); only the per-report event rate window
/// is reset by `report()`.
pub struct Metrics {
    /// Detections that reached the classifier (monotonic)
    detections_total: AtomicU64,
    /// Detections since last report (reset on report)
    detections_since_report: AtomicU64,
    /// Detections rejected at ingestion
    malformed_total: AtomicU64,
    valid_total: AtomicU64,
    plate_unknown_total: AtomicU64,
    color_mismatch_total: AtomicU64,
    /// Ingest latency: receipt to dispatch enqueue
    ingest_latency: Histogram,
    /// Sink write latency for successful writes
    persist_latency: Histogram,
    persisted_total: AtomicU64,
    persist_failures_total: AtomicU64,
    /// Events classified but not yet written (gauge)
    persist_backlog: AtomicU64,
    /// 1 when the sink is failing past the unhealthy threshold (gauge)
    persist_unhealthy: AtomicU64,
    registry_refresh_ok: AtomicU64,
    registry_refresh_failed: AtomicU64,
    registry_refresh_superseded: AtomicU64,
    /// Vehicles in the current snapshot (gauge)
    registry_size: AtomicU64,
    /// 1 when serving a stale snapshot (gauge)
    registry_stale: AtomicU64,
    /// Registered subscriptions (gauge)
    subscribers_active: AtomicU64,
    subscriber_overflows: AtomicU64,
    subscriber_closes: AtomicU64,
    subscriber_recoveries: AtomicU64,
    /// Aggregate deltas not delivered because the subscriber queue was full
    aggregate_deltas_skipped: AtomicU64,
    /// MQTT messages dropped before ingestion (channel full, non-UTF-8)
    mqtt_messages_dropped: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            detections_total: AtomicU64::new(0),
            detections_since_report: AtomicU64::new(0),
            malformed_total: AtomicU64::new(0),
            valid_total: AtomicU64::new(0),
            plate_unknown_total: AtomicU64::new(0),
            color_mismatch_total: AtomicU64::new(0),
            ingest_latency: Histogram::new(),
            persist_latency: Histogram::new(),
            persisted_total: AtomicU64::new(0),
            persist_failures_total: AtomicU64::new(0),
            persist_backlog: AtomicU64::new(0),
            persist_unhealthy: AtomicU64::new(0),
            registry_refresh_ok: AtomicU64::new(0),
            registry_refresh_failed: AtomicU64::new(0),
            registry_refresh_superseded: AtomicU64::new(0),
            registry_size: AtomicU64::new(0),
            registry_stale: AtomicU64::new(0),
            subscribers_active: AtomicU64::new(0),
            subscriber_overflows: AtomicU64::new(0),
            subscriber_closes: AtomicU64::new(0),
            subscriber_recoveries: AtomicU64::new(0),
            aggregate_deltas_skipped: AtomicU64::new(0),
            mqtt_messages_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a classified detection and its ingest latency (lock-free)
    #[inline]
    pub fn record_classified(&self, valid: bool, color_mismatch: bool, latency_us: u64) {
        self.detections_total.fetch_add(1, Ordering::Relaxed);
        self.detections_since_report.fetch_add(1, Ordering::Relaxed);
        if valid {
            self.valid_total.fetch_add(1, Ordering::Relaxed);
        } else if color_mismatch {
            self.color_mismatch_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plate_unknown_total.fetch_add(1, Ordering::Relaxed);
        }
        self.ingest_latency.record(latency_us);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mqtt_message_dropped(&self) {
        self.mqtt_messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Event handed to the persistence worker
    #[inline]
    pub fn record_persist_enqueued(&self) {
        self.persist_backlog.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persisted(&self, latency_us: u64) {
        self.persisted_total.fetch_add(1, Ordering::Relaxed);
        let backlog = self.persist_backlog.load(Ordering::Relaxed);
        if backlog > 0 {
            self.persist_backlog.fetch_sub(1, Ordering::Relaxed);
        }
        self.persist_latency.record(latency_us);
    }

    #[inline]
    pub fn record_persist_failure(&self) {
        self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_persist_unhealthy(&self, unhealthy: bool) {
        self.persist_unhealthy.store(unhealthy as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn persist_unhealthy(&self) -> bool {
        self.persist_unhealthy.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn persist_backlog(&self) -> u64 {
        self.persist_backlog.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_registry_refresh(&self, size: usize) {
        self.registry_refresh_ok.fetch_add(1, Ordering::Relaxed);
        self.registry_size.store(size as u64, Ordering::Relaxed);
        self.registry_stale.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_registry_refresh_failed(&self) {
        self.registry_refresh_failed.fetch_add(1, Ordering::Relaxed);
        self.registry_stale.store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_registry_refresh_superseded(&self) {
        self.registry_refresh_superseded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_subscribers_active(&self, count: usize) {
        self.subscribers_active.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_overflow(&self) {
        self.subscriber_overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_closed(&self) {
        self.subscriber_closes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_recovered(&self) {
        self.subscriber_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_aggregate_delta_skipped(&self) {
        self.aggregate_deltas_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn detections_total(&self) -> u64 {
        self.detections_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn malformed_total(&self) -> u64 {
        self.malformed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn subscriber_overflows(&self) -> u64 {
        self.subscriber_overflows.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn subscriber_closes(&self) -> u64 {
        self.subscriber_closes.load(Ordering::Relaxed)
    }

    /// Point-in-time summary without resetting the rate window
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    /// Summary for the periodic reporter; resets the rate window
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let detections_since = if reset {
            self.detections_since_report.swap(0, Ordering::Relaxed)
        } else {
            self.detections_since_report.load(Ordering::Relaxed)
        };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let detections_per_sec = if elapsed.as_secs_f64() > 0.0 {
            detections_since as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_per_sec,
            malformed_total: self.malformed_total.load(Ordering::Relaxed),
            valid_total: self.valid_total.load(Ordering::Relaxed),
            plate_unknown_total: self.plate_unknown_total.load(Ordering::Relaxed),
            color_mismatch_total: self.color_mismatch_total.load(Ordering::Relaxed),
            ingest_latency: self.ingest_latency.snapshot(),
            persist_latency: self.persist_latency.snapshot(),
            persisted_total: self.persisted_total.load(Ordering::Relaxed),
            persist_failures_total: self.persist_failures_total.load(Ordering::Relaxed),
            persist_backlog: self.persist_backlog.load(Ordering::Relaxed),
            persist_unhealthy: self.persist_unhealthy(),
            registry_refresh_ok: self.registry_refresh_ok.load(Ordering::Relaxed),
            registry_refresh_failed: self.registry_refresh_failed.load(Ordering::Relaxed),
            registry_refresh_superseded: self.registry_refresh_superseded.load(Ordering::Relaxed),
            registry_size: self.registry_size.load(Ordering::Relaxed),
            registry_stale: self.registry_stale.load(Ordering::Relaxed) != 0,
            subscribers_active: self.subscribers_active.load(Ordering::Relaxed),
            subscriber_overflows: self.subscriber_overflows.load(Ordering::Relaxed),
            subscriber_closes: self.subscriber_closes.load(Ordering::Relaxed),
            subscriber_recoveries: self.subscriber_recoveries.load(Ordering::Relaxed),
            aggregate_deltas_skipped: self.aggregate_deltas_skipped.load(Ordering::Relaxed),
            mqtt_messages_dropped: self.mqtt_messages_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub detections_total: u64,
    pub detections_per_sec: f64,
    pub malformed_total: u64,
    pub valid_total: u64,
    pub plate_unknown_total: u64,
    pub color_mismatch_total: u64,
    pub ingest_latency: HistogramSnapshot,
    pub persist_latency: HistogramSnapshot,
    pub persisted_total: u64,
    pub persist_failures_total: u64,
    pub persist_backlog: u64,
    pub persist_unhealthy: bool,
    pub registry_refresh_ok: u64,
    pub registry_refresh_failed: u64,
    pub registry_refresh_superseded: u64,
    pub registry_size: u64,
    pub registry_stale: bool,
    pub subscribers_active: u64,
    pub subscriber_overflows: u64,
    pub subscriber_closes: u64,
    pub subscriber_recoveries: u64,
    pub aggregate_deltas_skipped: u64,
    pub mqtt_messages_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            detections_total = %self.detections_total,
            detections_per_sec = format!("{:.1}", self.detections_per_sec),
            valid = %self.valid_total,
            plate_unknown = %self.plate_unknown_total,
            color_mismatch = %self.color_mismatch_total,
            malformed = %self.malformed_total,
            p50_us = %self.ingest_latency.p50_us,
            p99_us = %self.ingest_latency.p99_us,
            persist_backlog = %self.persist_backlog,
            persist_unhealthy = %self.persist_unhealthy,
            registry_size = %self.registry_size,
            registry_stale = %self.registry_stale,
            subscribers = %self.subscribers_active,
            overflows = %self.subscriber_overflows,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.detections_total(), 0);
        assert_eq!(metrics.persist_backlog(), 0);
        assert!(!metrics.persist_unhealthy());
    }

    #[test]
    fn test_record_classified_splits_by_reason() {
        let metrics = Metrics::new();
        metrics.record_classified(true, false, 100);
        metrics.record_classified(false, true, 200);
        metrics.record_classified(false, false, 300);
        metrics.record_classified(false, false, 300);

        let summary = metrics.snapshot();
        assert_eq!(summary.detections_total, 4);
        assert_eq!(summary.valid_total, 1);
        assert_eq!(summary.color_mismatch_total, 1);
        assert_eq!(summary.plate_unknown_total, 2);
        assert_eq!(summary.ingest_latency.count, 4);
        assert_eq!(summary.ingest_latency.avg_us, 225);
        assert_eq!(summary.ingest_latency.max_us, 300);
    }

    #[test]
    fn test_report_resets_rate_window_only() {
        let metrics = Metrics::new();
        metrics.record_classified(true, false, 100);
        metrics.record_classified(true, false, 100);

        let first = metrics.report();
        assert_eq!(first.detections_total, 2);
        assert_eq!(metrics.detections_since_report.load(Ordering::Relaxed), 0);

        // Totals and histograms are cumulative
        let second = metrics.report();
        assert_eq!(second.detections_total, 2);
        assert_eq!(second.ingest_latency.count, 2);
    }

    #[test]
    fn test_persist_backlog_gauge() {
        let metrics = Metrics::new();
        metrics.record_persist_enqueued();
        metrics.record_persist_enqueued();
        assert_eq!(metrics.persist_backlog(), 2);

        metrics.record_persisted(50);
        assert_eq!(metrics.persist_backlog(), 1);
        metrics.record_persisted(50);
        metrics.record_persisted(50);
        assert_eq!(metrics.persist_backlog(), 0);
    }

    #[test]
    fn test_registry_staleness_flag() {
        let metrics = Metrics::new();
        metrics.record_registry_refresh_failed();
        assert!(metrics.snapshot().registry_stale);

        metrics.record_registry_refresh(3);
        let summary = metrics.snapshot();
        assert!(!summary.registry_stale);
        assert_eq!(summary.registry_size, 3);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_classified(i % 2 == 0, false, i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.detections_total(), 10_000);
        assert_eq!(metrics.snapshot().valid_total, 5_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_classified(true, false, 150);
        }

        let summary = metrics.snapshot();
        assert_eq!(summary.ingest_latency.p50_us, 200);
        assert_eq!(summary.ingest_latency.p99_us, 200);
    }
}
