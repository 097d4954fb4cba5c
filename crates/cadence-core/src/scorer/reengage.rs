//! Re-engagement gating for idle relationships

use super::RelationshipKey;
use crate::config::ScorerConfig;
use serde::Serialize;

/// Thresholds for nudging an idle user
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReengagementRule {
    pub idle_days: f64,
    pub min_balance_cents: i64,
}

impl Default for ReengagementRule {
    fn default() -> Self {
        Self::from_config(&ScorerConfig::default())
    }
}

impl ReengagementRule {
    pub fn from_config(config: &ScorerConfig) -> Self {
        Self {
            idle_days: config.reengage_idle_days,
            min_balance_cents: config.reengage_min_balance_cents,
        }
    }

    /// Fire at most once per idle episode, and only for funded wallets
    pub fn should_trigger_reengagement(
        &self,
        idle_days: f64,
        wallet_balance_cents: i64,
        already_notified_since_last_interaction: bool,
    ) -> bool {
        idle_days > self.idle_days
            && wallet_balance_cents >= self.min_balance_cents
            && !already_notified_since_last_interaction
    }
}

/// Relationship eligible for a nudge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReengagementCandidate {
    pub key: RelationshipKey,
    pub idle_days: f64,
    pub balance_cents: i64,
    pub score: f64,
}
