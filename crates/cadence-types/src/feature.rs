//! Metered feature catalogue
//!
//! Every billable feature exists in a standard and an adult (`_18`) variant.
//! The two variants never share a wallet or a usage counter, so the mode is
//! part of the feature identity rather than a flag passed alongside it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of metered feature, independent of mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Text turn, billed per message
    Text,
    /// Voice note, billed per second
    Voice,
    /// Live call, billed per second
    LiveChat,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 3] = [FeatureKind::Text, FeatureKind::Voice, FeatureKind::LiveChat];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureKind::Text => "text",
            FeatureKind::Voice => "voice",
            FeatureKind::LiveChat => "live_chat",
        }
    }
}

/// Content mode of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Standard,
    Adult,
}

impl Mode {
    pub fn from_adult_flag(adult: bool) -> Self {
        if adult {
            Mode::Adult
        } else {
            Mode::Standard
        }
    }

    pub fn is_adult(self) -> bool {
        matches!(self, Mode::Adult)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Standard => "standard",
            Mode::Adult => "adult",
        }
    }
}

impl FromStr for Mode {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Mode::Standard),
            "adult" => Ok(Mode::Adult),
            other => Err(UnknownFeature(other.to_string())),
        }
    }
}

/// Unrecognised feature (or mode) identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature identifier: {0:?}")]
pub struct UnknownFeature(pub String);

/// A billable feature: kind plus mode
///
/// Serialized as its wire identifier (`text`, `text_18`, `voice`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Feature {
    pub kind: FeatureKind,
    pub mode: Mode,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::new(FeatureKind::Text, Mode::Standard),
        Feature::new(FeatureKind::Voice, Mode::Standard),
        Feature::new(FeatureKind::LiveChat, Mode::Standard),
        Feature::new(FeatureKind::Text, Mode::Adult),
        Feature::new(FeatureKind::Voice, Mode::Adult),
        Feature::new(FeatureKind::LiveChat, Mode::Adult),
    ];

    pub const fn new(kind: FeatureKind, mode: Mode) -> Self {
        Self { kind, mode }
    }

    pub const fn text(mode: Mode) -> Self {
        Self::new(FeatureKind::Text, mode)
    }

    pub const fn voice(mode: Mode) -> Self {
        Self::new(FeatureKind::Voice, mode)
    }

    /// Wire identifier, e.g. `voice_18`
    pub fn id(&self) -> &'static str {
        match (self.kind, self.mode) {
            (FeatureKind::Text, Mode::Standard) => "text",
            (FeatureKind::Voice, Mode::Standard) => "voice",
            (FeatureKind::LiveChat, Mode::Standard) => "live_chat",
            (FeatureKind::Text, Mode::Adult) => "text_18",
            (FeatureKind::Voice, Mode::Adult) => "voice_18",
            (FeatureKind::LiveChat, Mode::Adult) => "live_chat_18",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.id() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

impl TryFrom<String> for Feature {
    type Error = UnknownFeature;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Feature> for String {
    fn from(f: Feature) -> Self {
        f.id().to_string()
    }
}
