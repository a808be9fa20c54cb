//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `VehicleRecord` - a registered vehicle from the external registry
//! - `DetectionEvent` - one structured plate/attribute reading
//! - `MatchVerdict` - a detection resolved against the registry
//! - `ClassifiedEvent` - the append-only, sequence-numbered unit of record
//! - `EngineError` - the error kinds surfaced by the engine

pub mod access_log;
pub mod detection;
pub mod error;
pub mod types;

pub use access_log::{AccessLogRow, Classification, ClassifiedEvent, MatchVerdict, ReasonCode};
pub use error::{EngineError, EngineResult};
pub use types::{epoch_ms, DetectionEvent, Plate, Seq, VehicleRecord};
