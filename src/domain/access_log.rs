//! Match verdicts and classified events
//!
//! A `ClassifiedEvent` is the unit of record: created once per detection,
//! never mutated, persisted to the access log and broadcast to subscribers.

use crate::domain::types::{DetectionEvent, Plate, Seq, VehicleRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of resolving one detection against the registry snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchVerdict {
    pub detection: DetectionEvent,
    /// Normalized form of the observed plate
    pub plate: Plate,
    /// Registry record sharing the normalized plate, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<Arc<VehicleRecord>>,
    pub plate_matched: bool,
    /// `None` when not evaluated: plate unmatched, or observed color unknown
    pub color_matched: Option<bool>,
    /// Informational only, never changes the classification
    pub model_matched: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Valid,
    Suspicious,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Valid => "VALID",
            Classification::Suspicious => "SUSPICIOUS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    PlateUnknown,
    ColorMismatch,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Ok => "OK",
            ReasonCode::PlateUnknown => "PLATE_UNKNOWN",
            ReasonCode::ColorMismatch => "COLOR_MISMATCH",
        }
    }
}

/// Append-only log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedEvent {
    pub seq: Seq,
    /// UUIDv7 (time-sortable) record id for the external access log
    pub id: String,
    pub classification: Classification,
    pub reason: ReasonCode,
    #[serde(flatten)]
    pub verdict: MatchVerdict,
    /// Classification time (epoch ms)
    pub classified_at: u64,
}

impl ClassifiedEvent {
    pub fn new(
        seq: Seq,
        verdict: MatchVerdict,
        classification: Classification,
        reason: ReasonCode,
        classified_at: u64,
    ) -> Self {
        Self { seq, id: Uuid::now_v7().to_string(), classification, reason, verdict, classified_at }
    }

    /// Observation timestamp of the underlying detection (epoch ms)
    #[inline]
    pub fn ts(&self) -> u64 {
        self.verdict.detection.ts
    }

    #[inline]
    pub fn is_suspicious(&self) -> bool {
        self.classification == Classification::Suspicious
    }

    /// Plate resolves to a registered vehicle whose attributes disagree
    #[inline]
    pub fn is_fraud(&self) -> bool {
        self.reason == ReasonCode::ColorMismatch
    }

    /// Row for the external `access_logs` table
    pub fn to_access_log(&self) -> AccessLogRow {
        let detection = &self.verdict.detection;
        AccessLogRow {
            id: self.id.clone(),
            seq: self.seq.0,
            timestamp: iso_timestamp(detection.ts),
            plate_number: self.verdict.plate.to_string(),
            detected_color: detection.color.clone(),
            detected_model: detection.model.clone(),
            plate_matched: self.verdict.plate_matched,
            color_matched: self.verdict.color_matched.unwrap_or(true),
            classification: self.classification,
            reason: self.reason,
            source: detection.source.clone(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Persisted access-log row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessLogRow {
    pub id: String,
    pub seq: u64,
    pub timestamp: String,
    pub plate_number: String,
    pub detected_color: String,
    pub detected_model: String,
    pub plate_matched: bool,
    pub color_matched: bool,
    pub classification: Classification,
    pub reason: ReasonCode,
    pub source: String,
}

fn iso_timestamp(ts_ms: u64) -> String {
    i64::try_from(ts_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}
