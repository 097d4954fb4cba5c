use crate::feature::{Feature, FeatureKind, Mode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Billing unit of a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Message,
    Second,
}

/// Price rule for one feature
///
/// Read-only at request time; configured outside the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRule {
    pub unit: Unit,
    /// Price per unit in cents (5 ⇒ $0.05)
    pub price_cents: i64,
    /// Units per day that are not billed
    #[serde(default)]
    pub free_allowance: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl PriceRule {
    /// Free units left today given `used_today`
    pub fn free_left(&self, used_today: u64) -> u64 {
        (self.free_allowance as u64).saturating_sub(used_today)
    }

    /// Cost in cents of `units` more units after `used_today`
    ///
    /// `billable = max(units - free_left, 0)`, `cost = billable * price_cents`.
    pub fn cost_cents(&self, units: u32, used_today: u64) -> i64 {
        let billable = (units as u64).saturating_sub(self.free_left(used_today));
        billable as i64 * self.price_cents
    }
}

/// Wallet identity: one balance per user, counterparty and mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletKey {
    pub user_id: String,
    pub counterparty_id: String,
    pub mode: Mode,
}

impl WalletKey {
    pub fn new(user_id: impl Into<String>, counterparty_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            user_id: user_id.into(),
            counterparty_id: counterparty_id.into(),
            mode,
        }
    }
}

/// Immutable audit record
///
/// Charges carry negative `units`/`amount_cents`, top-ups positive ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: String,
    pub counterparty_id: String,
    pub mode: Mode,
    /// `None` for wallet top-ups
    pub feature: Option<Feature>,
    pub units: i64,
    pub amount_cents: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_top_up(&self) -> bool {
        self.feature.is_none()
    }
}

/// Per-feature usage for today
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUsage {
    pub kind: FeatureKind,
    pub used: u64,
    pub free_left: u64,
    pub price_cents: i64,
}

/// Wallet balance plus today's usage for one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub mode: Mode,
    pub balance_cents: i64,
    pub features: Vec<FeatureUsage>,
}

impl UsageSnapshot {
    pub fn feature(&self, kind: FeatureKind) -> Option<&FeatureUsage> {
        self.features.iter().find(|f| f.kind == kind)
    }
}
