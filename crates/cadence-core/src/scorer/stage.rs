//! Relationship stage progression
//!
//! Each turn carries optional [`Signals`] (strength of support, rudeness,
//! ...). They move two bounded counters: stage points in `[0, 100]`, which
//! pick the positive stage, and sentiment in `[-100, 100]`. Strong hate or
//! threat forces `Hate`, strong dislike or rejection forces `Dislike`,
//! regardless of points.

use cadence_types::RelationshipStage;
use serde::{Deserialize, Serialize};

/// Per-turn signal strengths, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signals {
    pub support: f64,
    pub affection: f64,
    pub flirt: f64,
    pub respect: f64,
    pub apology: f64,
    pub rude: f64,
    pub boundary_push: f64,
    pub dislike: f64,
    pub hate: f64,
    pub threat: f64,
    pub rejecting: f64,
    pub insult: f64,
}

impl Signals {
    fn is_calm(&self) -> bool {
        self.rude < 0.1
            && self.boundary_push < 0.1
            && self.dislike < 0.1
            && self.hate < 0.1
            && self.threat < 0.05
            && self.rejecting < 0.1
    }
}

/// Stage-point change for one turn, in `[-8, 3]`
///
/// A calm turn earns a small baseline even with no positive signal.
pub fn stage_delta(sig: &Signals) -> f64 {
    let mut delta = 2.0 * sig.support + 1.6 * sig.affection + 1.6 * sig.respect + 1.4 * sig.flirt;
    delta -= 5.0 * sig.boundary_push + 3.5 * sig.rude;
    delta -= 4.0 * sig.dislike + 8.0 * sig.hate + 10.0 * sig.threat + 4.0 * sig.rejecting + 2.0 * sig.insult;
    if sig.is_calm() {
        delta += 0.25;
    }
    delta.clamp(-8.0, 3.0)
}

/// Sentiment change for one turn, in `[-10, 5]`
pub fn sentiment_delta(sig: &Signals) -> f64 {
    let delta = 6.0 * sig.respect + 6.0 * sig.support + 4.0 * sig.affection + 6.0 * sig.apology
        - 10.0 * sig.rude
        - 14.0 * sig.boundary_push
        - 8.0 * sig.dislike
        - 16.0 * sig.hate
        - 20.0 * sig.threat
        - 6.0 * sig.insult
        - 6.0 * sig.rejecting;
    delta.clamp(-10.0, 5.0)
}

/// Stage after a turn with `sig`, given the updated points
pub fn stage_for(points: f64, sig: &Signals) -> RelationshipStage {
    if sig.threat > 0.20 || sig.hate > 0.60 {
        return RelationshipStage::Hate;
    }
    if sig.dislike > 0.40 || sig.rejecting > 0.40 {
        return RelationshipStage::Dislike;
    }
    RelationshipStage::from_points(points)
}

/// New `(stage_points, sentiment, stage)` after one turn
pub fn advance(stage_points: f64, sentiment: f64, sig: &Signals) -> (f64, f64, RelationshipStage) {
    let points = (stage_points + stage_delta(sig)).clamp(0.0, 100.0);
    let sentiment = (sentiment + sentiment_delta(sig)).clamp(-100.0, 100.0);
    (points, sentiment, stage_for(points, sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_calm_turn_earns_baseline() {
        let sig = Signals::default();
        assert!(approx(stage_delta(&sig), 0.25));
        assert_eq!(sentiment_delta(&sig), 0.0);
    }

    #[test]
    fn test_deltas_are_capped() {
        let warm = Signals {
            support: 1.0,
            affection: 1.0,
            respect: 1.0,
            flirt: 1.0,
            apology: 1.0,
            ..Signals::default()
        };
        assert_eq!(stage_delta(&warm), 3.0);
        assert_eq!(sentiment_delta(&warm), 5.0);

        let hostile = Signals {
            hate: 1.0,
            threat: 1.0,
            ..Signals::default()
        };
        assert_eq!(stage_delta(&hostile), -8.0);
        assert_eq!(sentiment_delta(&hostile), -10.0);
    }

    #[test]
    fn test_rudeness_cancels_baseline() {
        let sig = Signals {
            support: 0.5,
            rude: 0.1,
            ..Signals::default()
        };
        assert!(approx(stage_delta(&sig), 1.0 - 0.35));
    }

    #[test]
    fn test_negative_overrides() {
        let cases = [
            (Signals { threat: 0.21, ..Signals::default() }, RelationshipStage::Hate),
            (Signals { threat: 0.20, ..Signals::default() }, RelationshipStage::Dating),
            (Signals { hate: 0.61, ..Signals::default() }, RelationshipStage::Hate),
            (Signals { hate: 0.60, ..Signals::default() }, RelationshipStage::Dating),
            (Signals { dislike: 0.41, ..Signals::default() }, RelationshipStage::Dislike),
            (Signals { rejecting: 0.41, ..Signals::default() }, RelationshipStage::Dislike),
            (Signals { dislike: 0.40, ..Signals::default() }, RelationshipStage::Dating),
            (Signals { hate: 0.9, dislike: 0.9, ..Signals::default() }, RelationshipStage::Hate),
        ];
        for (sig, stage) in cases {
            assert_eq!(stage_for(80.0, &sig), stage, "{sig:?}");
        }
    }

    #[test]
    fn test_advance_stays_bounded() {
        let hostile = Signals {
            threat: 1.0,
            ..Signals::default()
        };
        let (points, sentiment, stage) = advance(3.0, -95.0, &hostile);
        assert_eq!(points, 0.0);
        assert_eq!(sentiment, -100.0);
        assert_eq!(stage, RelationshipStage::Hate);

        let warm = Signals {
            support: 1.0,
            apology: 1.0,
            ..Signals::default()
        };
        let (points, sentiment, stage) = advance(99.0, 98.0, &warm);
        assert_eq!(points, 100.0);
        assert_eq!(sentiment, 100.0);
        assert_eq!(stage, RelationshipStage::Dating);
    }

    #[test]
    fn test_crossing_into_talking() {
        let (points, _, stage) = advance(19.8, 0.0, &Signals::default());
        assert!(approx(points, 20.05));
        assert_eq!(stage, RelationshipStage::Talking);
    }
}
