//! Detection to registry matching
//!
//! Pure with respect to its inputs: the same detection against the same
//! snapshot always yields the same verdict.

use crate::domain::access_log::MatchVerdict;
use crate::domain::types::{DetectionEvent, Plate};
use crate::services::registry::{Registry, RegistrySnapshot};
use std::sync::Arc;

/// Observed color values that mean "the sensor could not tell"
const UNKNOWN_COLORS: [&str; 2] = ["", "unknown"];

/// Resolve one detection against a snapshot
pub fn match_detection(detection: DetectionEvent, snapshot: &RegistrySnapshot) -> MatchVerdict {
    let plate = Plate::normalize(&detection.plate);
    let vehicle = snapshot.lookup(&plate).cloned();
    let plate_matched = vehicle.is_some();

    let (color_matched, model_matched) = match &vehicle {
        Some(v) => (
            colors_match(&detection.color, &v.color),
            models_match(&detection.model, &v.make_model),
        ),
        None => (None, None),
    };

    MatchVerdict { detection, plate, vehicle, plate_matched, color_matched, model_matched }
}

/// Case-insensitive equality; `None` when the observed color is unknown
fn colors_match(observed: &str, registered: &str) -> Option<bool> {
    let observed = observed.trim();
    if UNKNOWN_COLORS.iter().any(|u| observed.eq_ignore_ascii_case(u)) {
        return None;
    }
    Some(observed.to_lowercase() == registered.trim().to_lowercase())
}

/// Either description contains the other, ignoring case. Informational only.
fn models_match(observed: &str, registered: &str) -> Option<bool> {
    let observed = observed.trim().to_lowercase();
    let registered = registered.trim().to_lowercase();
    if observed.is_empty() || registered.is_empty() {
        return None;
    }
    Some(observed.contains(&registered) || registered.contains(&observed))
}

/// Matcher bound to the live registry
#[derive(Clone)]
pub struct Matcher {
    registry: Arc<Registry>,
}

impl Matcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Match against whichever snapshot is current at call time
    pub fn match_detection(&self, detection: DetectionEvent) -> MatchVerdict {
        let snapshot = self.registry.snapshot();
        match_detection(detection, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::VehicleRecord;

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::from_records(vec![VehicleRecord::new("ABC1234", "Toyota Camry", "Red")], 1)
    }

    #[test]
    fn test_plate_normalized_before_lookup() {
        let v = match_detection(DetectionEvent::new(1, " abc 1234 ", "red"), &snapshot());
        assert!(v.plate_matched);
        assert_eq!(v.plate.as_str(), "ABC1234");
        assert_eq!(v.color_matched, Some(true));
    }

    #[test]
    fn test_color_case_insensitive() {
        let v = match_detection(DetectionEvent::new(1, "ABC1234", "RED"), &snapshot());
        assert_eq!(v.color_matched, Some(true));

        let v = match_detection(DetectionEvent::new(1, "ABC1234", "Blue"), &snapshot());
        assert_eq!(v.color_matched, Some(false));
    }

    #[test]
    fn test_no_partial_color_matching() {
        let v = match_detection(DetectionEvent::new(1, "ABC1234", "Dark Red"), &snapshot());
        assert_eq!(v.color_matched, Some(false));
    }

    #[test]
    fn test_color_not_evaluated_without_plate_match() {
        let v = match_detection(DetectionEvent::new(1, "XYZ9999", "Red"), &snapshot());
        assert!(!v.plate_matched);
        assert!(v.vehicle.is_none());
        assert_eq!(v.color_matched, None);
        assert_eq!(v.model_matched, None);
    }

    #[test]
    fn test_unknown_color_not_evaluated() {
        let v = match_detection(DetectionEvent::new(1, "ABC1234", ""), &snapshot());
        assert_eq!(v.color_matched, None);

        let v = match_detection(DetectionEvent::new(1, "ABC1234", "Unknown"), &snapshot());
        assert_eq!(v.color_matched, None);
    }

    #[test]
    fn test_model_containment() {
        let d = DetectionEvent::new(1, "ABC1234", "Red").with_model("toyota");
        assert_eq!(match_detection(d, &snapshot()).model_matched, Some(true));

        let d = DetectionEvent::new(1, "ABC1234", "Red").with_model("Toyota Camry Hybrid");
        assert_eq!(match_detection(d, &snapshot()).model_matched, Some(true));

        let d = DetectionEvent::new(1, "ABC1234", "Red").with_model("Honda");
        assert_eq!(match_detection(d, &snapshot()).model_matched, Some(false));

        let d = DetectionEvent::new(1, "ABC1234", "Red");
        assert_eq!(match_detection(d, &snapshot()).model_matched, None);
    }

    #[test]
    fn test_matcher_uses_current_snapshot() {
        let registry = Arc::new(Registry::new());
        let matcher = Matcher::new(registry.clone());
        assert!(!matcher.match_detection(DetectionEvent::new(1, "ABC1234", "Red")).plate_matched);

        let generation = registry.begin_refresh();
        registry.publish(generation, vec![VehicleRecord::new("ABC1234", "Toyota Camry", "Red")]);
        assert!(matcher.match_detection(DetectionEvent::new(1, "ABC1234", "Red")).plate_matched);
    }
}
