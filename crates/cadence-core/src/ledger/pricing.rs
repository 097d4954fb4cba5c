//! Price table for metered features
//!
//! Built-in defaults (per unit, free units per day):
//!
//! | feature     | unit    | price | free |
//! |-------------|---------|-------|------|
//! | `text`      | message | 5¢    | 100  |
//! | `voice`     | second  | 2¢    | 120  |
//! | `live_chat` | second  | 3¢    | 120  |
//!
//! Adult (`_18`) variants start with the same rules but are configured and
//! metered independently.
//!
//! ```
//! use cadence_core::ledger::PriceTable;
//! use cadence_types::{Feature, Mode};
//!
//! let table = PriceTable::defaults();
//! let text = table.rule(Feature::text(Mode::Standard)).unwrap();
//! assert_eq!(text.cost_cents(1, 100), 5);
//! ```

use cadence_types::{Feature, FeatureKind, PriceRule, Unit};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

static DEFAULT_TABLE: Lazy<BTreeMap<Feature, PriceRule>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    for feature in Feature::ALL {
        let rule = match feature.kind {
            FeatureKind::Text => PriceRule {
                unit: Unit::Message,
                price_cents: 5,
                free_allowance: 100,
                active: true,
            },
            FeatureKind::Voice => PriceRule {
                unit: Unit::Second,
                price_cents: 2,
                free_allowance: 120,
                active: true,
            },
            FeatureKind::LiveChat => PriceRule {
                unit: Unit::Second,
                price_cents: 3,
                free_allowance: 120,
                active: true,
            },
        };
        m.insert(feature, rule);
    }
    m
});

/// Feature → price rule, read-only once handed to the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    rules: BTreeMap<Feature, PriceRule>,
}

impl PriceTable {
    pub fn defaults() -> Self {
        Self {
            rules: DEFAULT_TABLE.clone(),
        }
    }

    /// Table with no rules at all
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, feature: Feature, rule: PriceRule) {
        self.rules.insert(feature, rule);
    }

    pub fn with(mut self, feature: Feature, rule: PriceRule) -> Self {
        self.set(feature, rule);
        self
    }

    pub fn rule(&self, feature: Feature) -> Option<&PriceRule> {
        self.rules.get(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, &PriceRule)> {
        self.rules.iter().map(|(f, r)| (*f, r))
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::defaults()
    }
}
