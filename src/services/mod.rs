//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `engine` - Ingestion pipeline and single serialization point
//! - `registry` - Registry snapshot and background refresher
//! - `matcher` - Resolves detections against the registry snapshot
//! - `classifier` - Fraud classification and sequence assignment
//! - `aggregator` - Rolling per-window counters
//! - `dispatcher` - Per-subscriber ordered delivery with resume and backpressure
//! - `persist_worker` - Async access-log writer with retry

pub mod aggregator;
pub mod classifier;
pub mod dispatcher;
pub mod engine;
pub mod matcher;
pub mod persist_worker;
pub mod registry;

// Re-export commonly used types
pub use aggregator::{AggregateBucket, Aggregator};
pub use classifier::Classifier;
pub use dispatcher::{Delivery, Dispatcher, SubscriberState, Subscription};
pub use engine::{Engine, EngineSettings, HealthReport};
pub use matcher::Matcher;
pub use persist_worker::{create_persist_worker, PersistSink, PersistWorker, RetryPolicy};
pub use registry::{
    create_registry_refresher, RefreshTrigger, Registry, RegistryRefresher, RegistrySource,
};
