//! Registry snapshot and background refresher
//!
//! The matcher reads an immutable `RegistrySnapshot` through an `Arc`. A
//! refresh builds a complete new table off to the side and publishes it by
//! swapping the pointer, so a lookup sees either the old table or the new one
//! in full. A failed refresh leaves the last good snapshot in service and
//! raises the staleness flag.

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::types::{epoch_ms, Plate, VehicleRecord};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// External registry collaborator
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Pull the complete registry
    async fn fetch_all_vehicles(&self) -> EngineResult<Vec<VehicleRecord>>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Immutable plate -> vehicle table
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    vehicles: FxHashMap<Plate, Arc<VehicleRecord>>,
    version: u64,
    loaded_at: u64,
}

impl RegistrySnapshot {
    /// Build a snapshot. Records with an empty plate are skipped; on a
    /// duplicate plate the first record wins.
    pub fn from_records(records: Vec<VehicleRecord>, version: u64) -> Self {
        let mut vehicles = FxHashMap::default();
        vehicles.reserve(records.len());
        for record in records {
            if record.plate.is_empty() {
                continue;
            }
            if vehicles.contains_key(&record.plate) {
                warn!(plate = %record.plate, "registry_duplicate_plate_ignored");
                continue;
            }
            vehicles.insert(record.plate.clone(), Arc::new(record));
        }
        Self { vehicles, version, loaded_at: epoch_ms() }
    }

    #[inline]
    pub fn lookup(&self, plate: &Plate) -> Option<&Arc<VehicleRecord>> {
        self.vehicles.get(plate)
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// 0 until the first successful load
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> u64 {
        self.loaded_at
    }
}

/// Registry health as reported on /health
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub version: u64,
    pub size: usize,
    pub stale: bool,
    pub loaded_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Holder of the current snapshot
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
    /// True until the first successful load and after any failed refresh
    stale: AtomicBool,
    /// Bumped by every refresh attempt; only the latest attempt may publish
    generation: AtomicU64,
    last_error: Mutex<Option<String>>,
    reloads: watch::Sender<u64>,
}

impl Registry {
    pub fn new() -> Self {
        let (reloads, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            stale: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            last_error: Mutex::new(None),
            reloads,
        }
    }

    /// Registry preloaded with a fixed set of records
    pub fn with_records(records: Vec<VehicleRecord>) -> Self {
        let registry = Self::new();
        let generation = registry.begin_refresh();
        registry.publish(generation, records);
        registry
    }

    /// Current snapshot; the reference stays valid across later swaps
    #[inline]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn lookup(&self, plate: &Plate) -> Option<Arc<VehicleRecord>> {
        self.current.read().lookup(plate).cloned()
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Start a refresh attempt, superseding any attempt still in flight
    pub fn begin_refresh(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Publish a fetched table. Returns false when a newer attempt has
    /// started since `generation` was issued; the result is then discarded.
    pub fn publish(&self, generation: u64, records: Vec<VehicleRecord>) -> bool {
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        let version = {
            let mut current = self.current.write();
            // Re-check under the write lock so two completions cannot interleave
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            let version = current.version + 1;
            *current = Arc::new(RegistrySnapshot::from_records(records, version));
            version
        };
        self.stale.store(false, Ordering::Release);
        *self.last_error.lock() = None;
        self.reloads.send_replace(version);
        true
    }

    /// Record a failed attempt. Superseded failures are ignored.
    pub fn mark_failed(&self, generation: u64, error: &EngineError) -> bool {
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.stale.store(true, Ordering::Release);
        *self.last_error.lock() = Some(error.to_string());
        true
    }

    /// Receiver notified with the new version after every successful reload
    pub fn subscribe_reloads(&self) -> watch::Receiver<u64> {
        self.reloads.subscribe()
    }

    pub fn status(&self) -> RegistryStatus {
        let snapshot = self.snapshot();
        RegistryStatus {
            version: snapshot.version(),
            size: snapshot.len(),
            stale: self.is_stale(),
            loaded_at: snapshot.loaded_at(),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Fetch and publish once, outside the background refresher
    pub async fn refresh_from(
        &self,
        source: &dyn RegistrySource,
        timeout: Duration,
    ) -> EngineResult<usize> {
        let generation = self.begin_refresh();
        match fetch_with_timeout(source, timeout).await {
            Ok(records) => {
                let count = records.len();
                if !self.publish(generation, records) {
                    return Err(EngineError::RegistryUnavailable(
                        "refresh superseded".to_string(),
                    ));
                }
                Ok(count)
            }
            Err(e) => {
                self.mark_failed(generation, &e);
                Err(e)
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_with_timeout(
    source: &dyn RegistrySource,
    timeout: Duration,
) -> EngineResult<Vec<VehicleRecord>> {
    match tokio::time::timeout(timeout, source.fetch_all_vehicles()).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::RegistryUnavailable(format!(
            "{} fetch timed out after {}ms",
            source.name(),
            timeout.as_millis()
        ))),
    }
}

type FetchFuture = Pin<Box<dyn Future<Output = EngineResult<Vec<VehicleRecord>>> + Send>>;

struct InFlight {
    generation: u64,
    started: Instant,
    fetch: FetchFuture,
}

/// Resolve the in-flight fetch, or never when nothing is in flight
async fn next_completion(
    in_flight: &mut Option<InFlight>,
) -> (u64, Instant, EngineResult<Vec<VehicleRecord>>) {
    match in_flight {
        Some(f) => {
            let result = (&mut f.fetch).await;
            (f.generation, f.started, result)
        }
        None => std::future::pending().await,
    }
}

/// Handle used to request an out-of-schedule refresh
#[derive(Clone)]
pub struct RefreshTrigger {
    tx: mpsc::Sender<()>,
}

impl RefreshTrigger {
    /// Request a refresh. Requests made while one is already queued coalesce.
    pub fn invalidate(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Background task that keeps the registry snapshot fresh
pub struct RegistryRefresher {
    registry: Arc<Registry>,
    source: Arc<dyn RegistrySource>,
    interval: Duration,
    fetch_timeout: Duration,
    invalidate_rx: mpsc::Receiver<()>,
    metrics: Arc<Metrics>,
}

impl RegistryRefresher {
    /// Run until shutdown. The first tick fires immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            source = %self.source.name(),
            interval_secs = %self.interval.as_secs(),
            "registry_refresher_started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<InFlight> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight = Some(self.start_fetch(in_flight.take(), "interval"));
                }
                Some(()) = self.invalidate_rx.recv() => {
                    in_flight = Some(self.start_fetch(in_flight.take(), "invalidated"));
                }
                (generation, started, result) = next_completion(&mut in_flight) => {
                    in_flight = None;
                    self.complete(generation, started, result);
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("registry_refresher_stopped");
    }

    fn start_fetch(&self, previous: Option<InFlight>, trigger: &'static str) -> InFlight {
        if let Some(previous) = previous {
            // Dropping the future cancels the old fetch
            debug!(generation = %previous.generation, "registry_refresh_superseded");
            self.metrics.record_registry_refresh_superseded();
        }

        let generation = self.registry.begin_refresh();
        debug!(generation = %generation, trigger = %trigger, "registry_refresh_started");

        let source = self.source.clone();
        let timeout = self.fetch_timeout;
        InFlight {
            generation,
            started: Instant::now(),
            fetch: Box::pin(async move { fetch_with_timeout(source.as_ref(), timeout).await }),
        }
    }

    fn complete(&self, generation: u64, started: Instant, result: EngineResult<Vec<VehicleRecord>>) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(records) => {
                if self.registry.publish(generation, records) {
                    let snapshot = self.registry.snapshot();
                    self.metrics.record_registry_refresh(snapshot.len());
                    info!(
                        version = %snapshot.version(),
                        vehicles = %snapshot.len(),
                        elapsed_ms = %elapsed_ms,
                        "registry_refreshed"
                    );
                } else {
                    self.metrics.record_registry_refresh_superseded();
                }
            }
            Err(e) => {
                if self.registry.mark_failed(generation, &e) {
                    self.metrics.record_registry_refresh_failed();
                    let status = self.registry.status();
                    error!(
                        error = %e,
                        serving_version = %status.version,
                        serving_vehicles = %status.size,
                        "registry_refresh_failed"
                    );
                }
            }
        }
    }
}

/// Create a refresher and the trigger used to invalidate its snapshot
///
/// Returns the trigger (for change notifications and the HTTP API) and the
/// refresher (to be spawned)
pub fn create_registry_refresher(
    registry: Arc<Registry>,
    source: Arc<dyn RegistrySource>,
    interval: Duration,
    fetch_timeout: Duration,
    metrics: Arc<Metrics>,
) -> (RefreshTrigger, RegistryRefresher) {
    let (tx, invalidate_rx) = mpsc::channel(1);
    let refresher =
        RegistryRefresher { registry, source, interval, fetch_timeout, invalidate_rx, metrics };
    (RefreshTrigger { tx }, refresher)
}
