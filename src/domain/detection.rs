//! Detection input parsing and validation
//!
//! Detections arrive as JSON objects (or arrays of objects) from the sensor
//! side. Field names follow both the engine's short form (`ts`, `plate`,
//! `color`, `model`, `source`) and the access-log column names used by the
//! recognition station (`timestamp`, `plate_number`, `detected_color`,
//! `detected_model`).

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::types::{deserialize_timestamp, DetectionEvent, Plate, TimestampValue};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawDetection {
    #[serde(default, alias = "timestamp", deserialize_with = "deserialize_timestamp")]
    pub ts: TimestampValue,
    #[serde(default, alias = "plate_number")]
    pub plate: Option<String>,
    #[serde(default, alias = "detected_color")]
    pub color: Option<String>,
    #[serde(default, alias = "detected_model", alias = "make_model")]
    pub model: Option<String>,
    #[serde(default, alias = "source_id")]
    pub source: Option<String>,
}

impl RawDetection {
    /// Validate into an immutable `DetectionEvent`.
    ///
    /// Plate and timestamp are mandatory. Color, model and source may be
    /// absent; an absent color means "unknown" to the matcher.
    pub fn validate(self) -> EngineResult<DetectionEvent> {
        let plate = match self.plate {
            Some(p) if !Plate::normalize(&p).is_empty() => p,
            Some(_) => return Err(EngineError::MalformedDetection("empty plate".to_string())),
            None => return Err(EngineError::MalformedDetection("missing plate".to_string())),
        };

        let ts = match &self.ts {
            TimestampValue::None => {
                return Err(EngineError::MalformedDetection("missing timestamp".to_string()))
            }
            other => other.to_epoch_ms().ok_or_else(|| {
                EngineError::MalformedDetection(format!("unparseable timestamp {other:?}"))
            })?,
        };

        Ok(DetectionEvent {
            ts,
            plate,
            color: self.color.map(|c| c.trim().to_string()).unwrap_or_default(),
            model: self.model.map(|m| m.trim().to_string()).unwrap_or_default(),
            source: self
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Parse one JSON payload into detections.
///
/// A payload may carry a single object or an array. Each element is
/// validated independently so one bad element does not reject its siblings.
pub fn parse_detections(payload: &str) -> Vec<EngineResult<DetectionEvent>> {
    let trimmed = payload.trim_start();
    if trimmed.starts_with('[') {
        match serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            Ok(items) => items
                .into_iter()
                .map(|v| {
                    serde_json::from_value::<RawDetection>(v)
                        .map_err(|e| EngineError::MalformedDetection(format!("invalid json: {e}")))
                        .and_then(RawDetection::validate)
                })
                .collect(),
            Err(e) => vec![Err(EngineError::MalformedDetection(format!("invalid json: {e}")))],
        }
    } else {
        vec![parse_detection(payload)]
    }
}

/// Parse a single JSON object into a detection
pub fn parse_detection(payload: &str) -> EngineResult<DetectionEvent> {
    serde_json::from_str::<RawDetection>(payload)
        .map_err(|e| EngineError::MalformedDetection(format!("invalid json: {e}")))?
        .validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_form() {
        let d = parse_detection(
            r#"{"ts":1700000000000,"plate":"abc 1234","color":"Red","model":"Toyota","source":"gate-1"}"#,
        )
        .unwrap();
        assert_eq!(d.ts, 1_700_000_000_000);
        assert_eq!(d.plate, "abc 1234");
        assert_eq!(d.color, "Red");
        assert_eq!(d.model, "Toyota");
        assert_eq!(d.source, "gate-1");
    }

    #[test]
    fn test_parse_access_log_column_names() {
        let d = parse_detection(
            r#"{"timestamp":"2024-01-01T00:00:00Z","plate_number":"WSG706","detected_color":"White","detected_model":"Perodua"}"#,
        )
        .unwrap();
        assert_eq!(d.ts, 1_704_067_200_000);
        assert_eq!(d.plate, "WSG706");
        assert_eq!(d.color, "White");
        assert_eq!(d.model, "Perodua");
        assert_eq!(d.source, "unknown");
    }

    #[test]
    fn test_missing_color_is_unknown_not_malformed() {
        let d = parse_detection(r#"{"ts":1,"plate":"ABC1234"}"#).unwrap();
        assert!(d.color.is_empty());
    }

    #[test]
    fn test_missing_plate_rejected() {
        let err = parse_detection(r#"{"ts":1,"color":"Red"}"#).unwrap_err();
        assert!(matches!(err, EngineError::MalformedDetection(ref m) if m == "missing plate"));

        let err = parse_detection(r#"{"ts":1,"plate":"   "}"#).unwrap_err();
        assert!(matches!(err, EngineError::MalformedDetection(ref m) if m == "empty plate"));
    }

    #[test]
    fn test_missing_or_bad_timestamp_rejected() {
        let err = parse_detection(r#"{"plate":"ABC1234"}"#).unwrap_err();
        assert!(matches!(err, EngineError::MalformedDetection(ref m) if m == "missing timestamp"));

        let err = parse_detection(r#"{"ts":"not a time","plate":"ABC1234"}"#).unwrap_err();
        assert!(matches!(err, EngineError::MalformedDetection(_)));

        let err = parse_detection(r#"{"ts":null,"plate":"ABC1234"}"#).unwrap_err();
        assert!(matches!(err, EngineError::MalformedDetection(_)));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(parse_detection("{not json"), Err(EngineError::MalformedDetection(_))));
    }

    #[test]
    fn test_parse_array_validates_each_element() {
        let results = parse_detections(
            r#"[{"ts":1,"plate":"AAA1"},{"ts":2},{"ts":3,"plate":"BBB2","color":"Blue"}]"#,
        );
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().color, "Blue");
    }
}
