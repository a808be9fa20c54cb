//! Shared types for the access engine

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Normalized licence plate: uppercase with all whitespace removed.
///
/// This is the registry key. Observed plates are normalized the same way
/// before lookup, so "abc 1234" and "ABC1234" resolve to the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plate(String);

impl Plate {
    pub fn normalize(raw: &str) -> Self {
        let plate: String =
            raw.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_uppercase).collect();
        Self(plate)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Plate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for classified-event sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Seq(pub u64);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    #[inline]
    pub fn next(self) -> Seq {
        Seq(self.0 + 1)
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered vehicle as cached from the external registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub plate: Plate,
    pub make_model: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    /// Registration time (epoch ms, 0 when the store did not report one)
    #[serde(default)]
    pub registered_at: u64,
}

impl VehicleRecord {
    pub fn new(plate: &str, make_model: &str, color: &str) -> Self {
        Self {
            plate: Plate::normalize(plate),
            make_model: make_model.to_string(),
            color: color.to_string(),
            owner_name: None,
            registered_at: 0,
        }
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner_name = Some(owner.to_string());
        self
    }
}

/// A single structured reading from an access point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    /// Observation time (epoch ms)
    pub ts: u64,
    /// Plate string as observed, before normalization
    pub plate: String,
    /// Observed color, empty when the sensor could not tell
    pub color: String,
    /// Observed make/model description, empty when unknown
    pub model: String,
    /// Access point / sensor identifier
    pub source: String,
}

impl DetectionEvent {
    pub fn new(ts: u64, plate: &str, color: &str) -> Self {
        Self {
            ts,
            plate: plate.to_string(),
            color: color.to_string(),
            model: String::new(),
            source: "unknown".to_string(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

impl TimestampValue {
    /// Resolve to epoch milliseconds; `None` when missing or unparseable
    pub fn to_epoch_ms(&self) -> Option<u64> {
        match self {
            TimestampValue::None => None,
            TimestampValue::EpochMs(ms) => Some(*ms),
            TimestampValue::IsoString(s) => parse_iso_ms(s),
        }
    }
}

/// Parse an RFC 3339 timestamp. Naive timestamps (no offset), as written by
/// the registry store's default columns, are taken as UTC.
fn parse_iso_ms(s: &str) -> Option<u64> {
    let s = s.trim();
    let parsed = OffsetDateTime::parse(s, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(&format!("{s}Z"), &Rfc3339))
        .ok()?;
    let ms = parsed.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(ms).ok()
}

pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            // Negative epochs are treated as missing
            match u64::try_from(value) {
                Ok(ms) => Ok(TimestampValue::EpochMs(ms)),
                Err(_) => Ok(TimestampValue::None),
            }
        }

        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value >= 0.0 {
                Ok(TimestampValue::EpochMs(value as u64))
            } else {
                Ok(TimestampValue::None)
            }
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }

        fn visit_none<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plate_normalize() {
        assert_eq!(Plate::normalize("abc 1234").as_str(), "ABC1234");
        assert_eq!(Plate::normalize("  WSG\t706\n").as_str(), "WSG706");
        assert_eq!(Plate::normalize("ABC1234"), Plate::normalize("a b c 1 2 3 4"));
        assert!(Plate::normalize("   ").is_empty());
    }

    #[test]
    fn test_seq_ordering() {
        assert!(Seq(2) > Seq(1));
        assert_eq!(Seq::ZERO.next(), Seq(1));
    }

    #[test]
    fn test_timestamp_iso_with_offset() {
        let ts = TimestampValue::IsoString("2024-01-01T00:00:00Z".to_string());
        assert_eq!(ts.to_epoch_ms(), Some(1_704_067_200_000));

        let ts = TimestampValue::IsoString("2024-01-01T02:00:00+02:00".to_string());
        assert_eq!(ts.to_epoch_ms(), Some(1_704_067_200_000));
    }

    #[test]
    fn test_timestamp_naive_iso_is_utc() {
        let ts = TimestampValue::IsoString("2024-01-01T00:00:00.500".to_string());
        assert_eq!(ts.to_epoch_ms(), Some(1_704_067_200_500));
    }

    #[test]
    fn test_timestamp_invalid() {
        assert_eq!(TimestampValue::IsoString("yesterday".to_string()).to_epoch_ms(), None);
        assert_eq!(TimestampValue::None.to_epoch_ms(), None);
        assert_eq!(TimestampValue::EpochMs(42).to_epoch_ms(), Some(42));
    }
}
