//! Fraud classification and sequence assignment

use crate::domain::access_log::{Classification, ClassifiedEvent, MatchVerdict, ReasonCode};
use crate::domain::types::{epoch_ms, Seq};

/// Classification policy, applied in order:
/// 1. plate unknown -> SUSPICIOUS / PLATE_UNKNOWN
/// 2. color differs -> SUSPICIOUS / COLOR_MISMATCH
/// 3. otherwise (color equal or unknown) -> VALID / OK
pub fn decide(verdict: &MatchVerdict) -> (Classification, ReasonCode) {
    if !verdict.plate_matched {
        return (Classification::Suspicious, ReasonCode::PlateUnknown);
    }
    match verdict.color_matched {
        Some(false) => (Classification::Suspicious, ReasonCode::ColorMismatch),
        Some(true) | None => (Classification::Valid, ReasonCode::Ok),
    }
}

/// Owns the single monotonic sequence counter
#[derive(Debug)]
pub struct Classifier {
    next_seq: Seq,
}

impl Classifier {
    /// First event gets sequence 1
    pub fn new() -> Self {
        Self::starting_after(Seq::ZERO)
    }

    /// Continue after a sequence already used, e.g. recovered from the sink
    pub fn starting_after(last: Seq) -> Self {
        Self { next_seq: last.next() }
    }

    /// Classify and assign the next sequence number. Cannot fail.
    pub fn classify(&mut self, verdict: MatchVerdict) -> ClassifiedEvent {
        let (classification, reason) = decide(&verdict);
        let seq = self.next_seq;
        self.next_seq = seq.next();
        ClassifiedEvent::new(seq, verdict, classification, reason, epoch_ms())
    }

    /// Highest sequence handed out so far (0 if none)
    pub fn last_assigned(&self) -> Seq {
        Seq(self.next_seq.0 - 1)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DetectionEvent, VehicleRecord};
    use crate::services::matcher::match_detection;
    use crate::services::registry::RegistrySnapshot;

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::from_records(vec![VehicleRecord::new("ABC1234", "Toyota Camry", "Red")], 1)
    }

    fn classify(classifier: &mut Classifier, plate: &str, color: &str) -> ClassifiedEvent {
        classifier.classify(match_detection(DetectionEvent::new(1, plate, color), &snapshot()))
    }

    #[test]
    fn test_registry_scenario() {
        let mut c = Classifier::new();

        let e = classify(&mut c, "ABC1234", "Red");
        assert_eq!((e.classification, e.reason), (Classification::Valid, ReasonCode::Ok));

        let e = classify(&mut c, "ABC1234", "Blue");
        assert_eq!(
            (e.classification, e.reason),
            (Classification::Suspicious, ReasonCode::ColorMismatch)
        );

        let e = classify(&mut c, "XYZ9999", "Red");
        assert_eq!(
            (e.classification, e.reason),
            (Classification::Suspicious, ReasonCode::PlateUnknown)
        );
    }

    #[test]
    fn test_unknown_plate_regardless_of_color() {
        let mut c = Classifier::new();
        for color in ["Red", "Blue", "", "unknown"] {
            assert_eq!(classify(&mut c, "NOPE1", color).reason, ReasonCode::PlateUnknown);
        }
    }

    #[test]
    fn test_unknown_color_is_valid() {
        let mut c = Classifier::new();
        let e = classify(&mut c, "ABC1234", "");
        assert_eq!(e.classification, Classification::Valid);
        assert_eq!(e.reason, ReasonCode::Ok);
    }

    #[test]
    fn test_sequence_starts_at_one_and_is_gap_free() {
        let mut c = Classifier::new();
        assert_eq!(c.last_assigned(), Seq::ZERO);

        let seqs: Vec<u64> = (0..50).map(|_| classify(&mut c, "ABC1234", "Red").seq.0).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
        assert_eq!(c.last_assigned(), Seq(50));
    }

    #[test]
    fn test_starting_after_recovered_sequence() {
        let mut c = Classifier::starting_after(Seq(41));
        assert_eq!(classify(&mut c, "ABC1234", "Red").seq, Seq(42));
    }
}
