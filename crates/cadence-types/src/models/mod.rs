//! Data models shared between the ledger, scorer and transport

pub mod ledger;
pub mod relationship;

pub use ledger::{FeatureUsage, LedgerEntry, PriceRule, Unit, UsageSnapshot, WalletKey};
pub use relationship::{Dimensions, RelationshipSnapshot, RelationshipStage};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one chat conversation (one buffer, one turn gate)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
