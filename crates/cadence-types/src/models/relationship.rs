use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relationship dimensions, each in `[0, 100]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub trust: f64,
    pub closeness: f64,
    pub attraction: f64,
    pub safety: f64,
}

impl Dimensions {
    pub const ZERO: Dimensions = Dimensions {
        trust: 0.0,
        closeness: 0.0,
        attraction: 0.0,
        safety: 0.0,
    };

    /// Clamp every dimension into `[0, 100]`
    pub fn clamped(self) -> Self {
        Self {
            trust: self.trust.clamp(0.0, 100.0),
            closeness: self.closeness.clamp(0.0, 100.0),
            attraction: self.attraction.clamp(0.0, 100.0),
            safety: self.safety.clamp(0.0, 100.0),
        }
    }
}

impl Default for Dimensions {
    /// Starting point for a brand-new relationship
    fn default() -> Self {
        Self {
            trust: 10.0,
            closeness: 10.0,
            attraction: 5.0,
            safety: 95.0,
        }
    }
}

/// Where a relationship stands
///
/// Positive stages follow accumulated stage points; the two negative stages
/// are reached only through strongly negative turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipStage {
    Hate,
    Dislike,
    #[default]
    Strangers,
    Talking,
    Flirting,
    Dating,
}

impl RelationshipStage {
    pub const ALL: [RelationshipStage; 6] = [
        RelationshipStage::Hate,
        RelationshipStage::Dislike,
        RelationshipStage::Strangers,
        RelationshipStage::Talking,
        RelationshipStage::Flirting,
        RelationshipStage::Dating,
    ];

    /// Positive stage for `points` in `[0, 100]`
    pub fn from_points(points: f64) -> Self {
        if points < 20.0 {
            RelationshipStage::Strangers
        } else if points < 45.0 {
            RelationshipStage::Talking
        } else if points < 65.0 {
            RelationshipStage::Flirting
        } else {
            RelationshipStage::Dating
        }
    }

    pub fn is_negative(self) -> bool {
        matches!(self, RelationshipStage::Hate | RelationshipStage::Dislike)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipStage::Hate => "hate",
            RelationshipStage::Dislike => "dislike",
            RelationshipStage::Strangers => "strangers",
            RelationshipStage::Talking => "talking",
            RelationshipStage::Flirting => "flirting",
            RelationshipStage::Dating => "dating",
        }
    }
}

/// Relationship view delivered alongside a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSnapshot {
    pub score: f64,
    pub cooldown: u32,
    pub dimensions: Dimensions,
    #[serde(default)]
    pub stage: RelationshipStage,
    /// Progress toward the next stage, `[0, 100]`
    #[serde(default)]
    pub stage_points: f64,
    /// Running mood, `[-100, 100]`
    #[serde(default)]
    pub sentiment: f64,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_thresholds() {
        let cases = [
            (0.0, RelationshipStage::Strangers),
            (19.99, RelationshipStage::Strangers),
            (20.0, RelationshipStage::Talking),
            (44.99, RelationshipStage::Talking),
            (45.0, RelationshipStage::Flirting),
            (64.99, RelationshipStage::Flirting),
            (65.0, RelationshipStage::Dating),
            (100.0, RelationshipStage::Dating),
        ];
        for (points, stage) in cases {
            assert_eq!(RelationshipStage::from_points(points), stage, "{points}");
        }
    }

    #[test]
    fn test_stage_wire_format() {
        assert_eq!(serde_json::to_string(&RelationshipStage::Flirting).unwrap(), "\"FLIRTING\"");
        let snapshot: RelationshipSnapshot = serde_json::from_str(
            r#"{"score": 50.0, "cooldown": 0,
                "dimensions": {"trust": 1.0, "closeness": 2.0, "attraction": 3.0, "safety": 4.0},
                "last_interaction_at": null}"#,
        )
        .unwrap();
        assert_eq!(snapshot.stage, RelationshipStage::Strangers);
        assert_eq!(snapshot.sentiment, 0.0);
    }
}
