//! Credit ledger
//!
//! Meters feature usage against a daily free allowance and a per-counterparty
//! wallet. The ledger is the only writer of wallets, usage counters and
//! ledger entries.
//!
//! Concurrency: charges and top-ups on one wallet are serialized in-process by
//! a per-wallet lock, and the store's conditional debit refuses to overdraw
//! when several processes share a database.

pub mod pricing;

pub use pricing::PriceTable;

use crate::clock::Clock;
use crate::error::{LedgerError, StoreError};
use crate::store::{ChargeCommit, LedgerStore, PendingReconciliation};
use cadence_types::{Feature, FeatureKind, FeatureUsage, LedgerEntry, Mode, PriceRule, UsageSnapshot, WalletKey};
use chrono::NaiveDate;
use dashmap::DashMap;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata key carrying a caller-chosen idempotency key
pub const IDEMPOTENCY_KEY: &str = "idempotency_key";

/// Read-only preview of a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Affordability {
    pub ok: bool,
    pub cost_cents: i64,
    pub free_left: u64,
    pub balance_cents: i64,
}

/// Credit ledger over a [`LedgerStore`]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    prices: PriceTable,
    clock: Arc<dyn Clock>,
    wallet_locks: DashMap<WalletKey, Arc<Mutex<()>>>,
    /// Idempotency key → amount charged, fronting the persisted lookup
    recent_charges: Cache<String, i64>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, prices: PriceTable, clock: Arc<dyn Clock>) -> Self {
        let recent_charges = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(60 * 60))
            .build();

        Self {
            store,
            prices,
            clock,
            wallet_locks: DashMap::new(),
            recent_charges,
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Run `f` holding the wallet's lock
    ///
    /// The lock entry is dropped again once nobody else holds or waits on it,
    /// so the map only tracks wallets with a charge in progress.
    fn with_wallet_lock<T>(&self, wallet: &WalletKey, f: impl FnOnce() -> T) -> T {
        let lock = self
            .wallet_locks
            .entry(wallet.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let out = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.wallet_locks.remove_if(wallet, |_, l| Arc::strong_count(l) == 1);
        out
    }

    fn active_rule(&self, feature: Feature) -> Result<PriceRule, LedgerError> {
        let rule = self
            .prices
            .rule(feature)
            .copied()
            .ok_or(LedgerError::PricingNotConfigured(feature))?;
        if !rule.active {
            return Err(LedgerError::FeatureInactive(feature));
        }
        Ok(rule)
    }

    fn quote(
        &self,
        wallet: &WalletKey,
        feature: Feature,
        rule: &PriceRule,
        units: u32,
        day: NaiveDate,
    ) -> Result<Affordability, LedgerError> {
        let used = self.store.get_daily_usage(&wallet.user_id, day, feature)?;
        let free_left = rule.free_left(used);
        let cost_cents = rule.cost_cents(units, used);
        let balance_cents = self.store.get_wallet(wallet)?;

        Ok(Affordability {
            ok: cost_cents == 0 || balance_cents >= cost_cents,
            cost_cents,
            free_left,
            balance_cents,
        })
    }

    /// Preview whether `units` of `feature` can be paid for; no mutation
    pub fn can_afford(
        &self,
        user_id: &str,
        counterparty_id: &str,
        feature: Feature,
        units: u32,
    ) -> Result<Affordability, LedgerError> {
        let rule = self.active_rule(feature)?;
        let wallet = WalletKey::new(user_id, counterparty_id, feature.mode);
        self.quote(&wallet, feature, &rule, units, self.clock.today())
    }

    /// Charge `units` of `feature`, returning the amount debited in cents
    ///
    /// Debit, usage increment and ledger entry commit together or not at all.
    /// When `metadata` carries an `idempotency_key` already seen, the original
    /// amount is returned and nothing is written.
    pub fn charge_feature(
        &self,
        user_id: &str,
        counterparty_id: &str,
        feature: Feature,
        units: u32,
        metadata: serde_json::Value,
    ) -> Result<i64, LedgerError> {
        if units == 0 {
            return Err(LedgerError::InvalidAmount("cannot charge zero units".to_string()));
        }
        let rule = self.active_rule(feature)?;
        let wallet = WalletKey::new(user_id, counterparty_id, feature.mode);
        let idempotency_key = metadata
            .get(IDEMPOTENCY_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.with_wallet_lock(&wallet, || {
            self.charge_locked(&wallet, feature, &rule, units, metadata, idempotency_key)
        })
    }

    fn charge_locked(
        &self,
        wallet: &WalletKey,
        feature: Feature,
        rule: &PriceRule,
        units: u32,
        metadata: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<i64, LedgerError> {
        let user_id = wallet.user_id.as_str();
        let counterparty_id = wallet.counterparty_id.as_str();

        if let Some(key) = &idempotency_key {
            if let Some(amount) = self.previous_charge(key)? {
                debug!(idempotency_key = %key, amount_cents = amount, "Charge already applied");
                return Ok(amount);
            }
        }

        // One clock read: the allowance priced and the day recorded must match
        let now = self.clock.now();
        let quote = self.quote(wallet, feature, rule, units, now.date_naive())?;
        if quote.cost_cents > quote.balance_cents {
            info!(
                user_id,
                counterparty_id,
                feature = %feature,
                cost_cents = quote.cost_cents,
                balance_cents = quote.balance_cents,
                "Charge refused: insufficient credits"
            );
            return Err(LedgerError::InsufficientCredits {
                feature,
                needed_cents: quote.cost_cents,
                balance_cents: quote.balance_cents,
                free_left: quote.free_left,
            });
        }

        let commit = ChargeCommit {
            wallet: wallet.clone(),
            day: now.date_naive(),
            feature,
            units,
            amount_cents: quote.cost_cents,
            entry: LedgerEntry {
                user_id: user_id.to_string(),
                counterparty_id: counterparty_id.to_string(),
                mode: feature.mode,
                feature: Some(feature),
                units: -(units as i64),
                amount_cents: -quote.cost_cents,
                metadata,
                idempotency_key: idempotency_key.clone(),
                created_at: now,
            },
        };

        let balance = self.store.apply_charge(&commit).map_err(|e| match e {
            // Another process drained the wallet between quote and debit
            StoreError::InsufficientBalance { balance_cents, .. } => LedgerError::InsufficientCredits {
                feature,
                needed_cents: quote.cost_cents,
                balance_cents,
                free_left: quote.free_left,
            },
            other => LedgerError::Store(other),
        })?;

        if let Some(key) = idempotency_key {
            self.recent_charges.insert(key, quote.cost_cents);
        }

        info!(
            user_id,
            counterparty_id,
            feature = %feature,
            units,
            amount_cents = quote.cost_cents,
            balance_cents = balance,
            "Feature charged"
        );
        Ok(quote.cost_cents)
    }

    fn previous_charge(&self, key: &str) -> Result<Option<i64>, LedgerError> {
        if let Some(amount) = self.recent_charges.get(key) {
            return Ok(Some(amount));
        }
        let Some(entry) = self.store.find_charge_by_idempotency_key(key)? else {
            return Ok(None);
        };
        let amount = -entry.amount_cents;
        self.recent_charges.insert(key.to_string(), amount);
        Ok(Some(amount))
    }

    /// Credit a wallet, returning the new balance
    pub fn top_up(
        &self,
        user_id: &str,
        counterparty_id: &str,
        mode: Mode,
        amount_cents: i64,
        source: &str,
    ) -> Result<i64, LedgerError> {
        if amount_cents <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "top-up must be positive, got {}",
                amount_cents
            )));
        }

        let wallet = WalletKey::new(user_id, counterparty_id, mode);
        let entry = LedgerEntry {
            user_id: user_id.to_string(),
            counterparty_id: counterparty_id.to_string(),
            mode,
            feature: None,
            units: 0,
            amount_cents,
            metadata: serde_json::json!({ "source": source }),
            idempotency_key: None,
            created_at: self.clock.now(),
        };
        let balance = self
            .with_wallet_lock(&wallet, || self.store.credit_wallet(&wallet, amount_cents, &entry))?;

        info!(user_id, counterparty_id, mode = mode.as_str(), amount_cents, balance_cents = balance, source, "Wallet topped up");
        Ok(balance)
    }

    pub fn balance(&self, wallet: &WalletKey) -> Result<i64, LedgerError> {
        Ok(self.store.get_wallet(wallet)?)
    }

    /// Balance plus today's per-feature usage for one mode
    pub fn usage_snapshot(&self, user_id: &str, counterparty_id: &str, mode: Mode) -> Result<UsageSnapshot, LedgerError> {
        let wallet = WalletKey::new(user_id, counterparty_id, mode);
        let today = self.clock.today();

        let mut features = Vec::with_capacity(FeatureKind::ALL.len());
        for kind in FeatureKind::ALL {
            let feature = Feature::new(kind, mode);
            let Some(rule) = self.prices.rule(feature) else {
                continue;
            };
            let used = self.store.get_daily_usage(user_id, today, feature)?;
            features.push(FeatureUsage {
                kind,
                used,
                free_left: rule.free_left(used),
                price_cents: rule.price_cents,
            });
        }

        Ok(UsageSnapshot {
            mode,
            balance_cents: self.store.get_wallet(&wallet)?,
            features,
        })
    }

    pub fn ledger_entries(
        &self,
        user_id: &str,
        counterparty_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.ledger_entries(user_id, counterparty_id, limit)?)
    }

    /// Queue a charge that could not be recorded for later reconciliation
    pub fn record_reconciliation(&self, pending: &PendingReconciliation) -> Result<(), LedgerError> {
        warn!(
            conversation_id = %pending.conversation_id,
            feature = %pending.feature,
            units = pending.units,
            error = %pending.error,
            "Charge queued for reconciliation"
        );
        Ok(self.store.record_reconciliation(pending)?)
    }

    pub fn pending_reconciliations(&self) -> Result<Vec<PendingReconciliation>, LedgerError> {
        Ok(self.store.pending_reconciliations()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use cadence_types::Unit;
    use chrono::{Duration, TimeZone, Utc};

    fn ledger_with(prices: PriceTable) -> (CreditLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()));
        let ledger = CreditLedger::new(Arc::new(MemoryStore::new()), prices, clock.clone());
        (ledger, clock)
    }

    fn no_allowance_text() -> PriceTable {
        PriceTable::defaults().with(
            Feature::text(Mode::Standard),
            PriceRule {
                unit: Unit::Message,
                price_cents: 5,
                free_allowance: 0,
                active: true,
            },
        )
    }

    #[test]
    fn test_free_allowance_then_billing() {
        let prices = PriceTable::defaults().with(
            Feature::text(Mode::Standard),
            PriceRule {
                unit: Unit::Message,
                price_cents: 5,
                free_allowance: 2,
                active: true,
            },
        );
        let (ledger, _) = ledger_with(prices);
        let text = Feature::text(Mode::Standard);
        ledger.top_up("u", "c", Mode::Standard, 7, "test").unwrap();

        assert_eq!(ledger.charge_feature("u", "c", text, 1, serde_json::json!({})).unwrap(), 0);
        assert_eq!(ledger.charge_feature("u", "c", text, 1, serde_json::json!({})).unwrap(), 0);

        let quote = ledger.can_afford("u", "c", text, 1).unwrap();
        assert_eq!(quote.free_left, 0);
        assert_eq!(quote.cost_cents, 5);
        assert!(quote.ok);

        assert_eq!(ledger.charge_feature("u", "c", text, 1, serde_json::json!({})).unwrap(), 5);
        let err = ledger.charge_feature("u", "c", text, 1, serde_json::json!({})).unwrap_err();
        assert!(err.is_insufficient_credits());
        assert_eq!(ledger.balance(&WalletKey::new("u", "c", Mode::Standard)).unwrap(), 2);
    }

    #[test]
    fn test_allowance_resets_next_day() {
        let prices = PriceTable::defaults().with(
            Feature::text(Mode::Standard),
            PriceRule {
                unit: Unit::Message,
                price_cents: 5,
                free_allowance: 1,
                active: true,
            },
        );
        let (ledger, clock) = ledger_with(prices);
        let text = Feature::text(Mode::Standard);

        ledger.charge_feature("u", "c", text, 1, serde_json::json!({})).unwrap();
        assert!(!ledger.can_afford("u", "c", text, 1).unwrap().ok);

        clock.advance(Duration::days(1));
        let quote = ledger.can_afford("u", "c", text, 1).unwrap();
        assert!(quote.ok);
        assert_eq!(quote.free_left, 1);
    }

    #[test]
    fn test_adult_wallet_is_separate() {
        let (ledger, _) = ledger_with(no_allowance_text());
        ledger.top_up("u", "c", Mode::Adult, 100, "test").unwrap();

        let standard = ledger.can_afford("u", "c", Feature::text(Mode::Standard), 1).unwrap();
        assert!(!standard.ok);
        assert_eq!(standard.balance_cents, 0);

        let adult = ledger.usage_snapshot("u", "c", Mode::Adult).unwrap();
        assert_eq!(adult.balance_cents, 100);
        assert_eq!(adult.feature(FeatureKind::Text).unwrap().free_left, 100);
    }

    #[test]
    fn test_idempotent_charge() {
        let (ledger, _) = ledger_with(no_allowance_text());
        let text = Feature::text(Mode::Standard);
        ledger.top_up("u", "c", Mode::Standard, 20, "test").unwrap();

        let meta = serde_json::json!({ IDEMPOTENCY_KEY: "turn-7" });
        assert_eq!(ledger.charge_feature("u", "c", text, 1, meta.clone()).unwrap(), 5);
        assert_eq!(ledger.charge_feature("u", "c", text, 1, meta).unwrap(), 5);
        assert_eq!(ledger.balance(&WalletKey::new("u", "c", Mode::Standard)).unwrap(), 15);
        // Top-up plus one charge
        assert_eq!(ledger.ledger_entries("u", None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_inactive_and_unpriced_features() {
        let mut prices = PriceTable::empty();
        prices.set(
            Feature::voice(Mode::Standard),
            PriceRule {
                unit: Unit::Second,
                price_cents: 2,
                free_allowance: 0,
                active: false,
            },
        );
        let (ledger, _) = ledger_with(prices);

        assert!(matches!(
            ledger.can_afford("u", "c", Feature::voice(Mode::Standard), 10),
            Err(LedgerError::FeatureInactive(_))
        ));
        assert!(matches!(
            ledger.charge_feature("u", "c", Feature::text(Mode::Standard), 1, serde_json::json!({})),
            Err(LedgerError::PricingNotConfigured(_))
        ));
    }

    #[test]
    fn test_invalid_amounts() {
        let (ledger, _) = ledger_with(PriceTable::defaults());
        assert!(matches!(
            ledger.top_up("u", "c", Mode::Standard, 0, "test"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.charge_feature("u", "c", Feature::text(Mode::Standard), 0, serde_json::json!({})),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_ledger_entry_signs() {
        let (ledger, _) = ledger_with(no_allowance_text());
        ledger.top_up("u", "c", Mode::Standard, 50, "card").unwrap();
        ledger
            .charge_feature("u", "c", Feature::text(Mode::Standard), 1, serde_json::json!({"turn": 1}))
            .unwrap();

        let entries = ledger.ledger_entries("u", Some("c"), 10).unwrap();
        assert_eq!(entries[0].units, -1);
        assert_eq!(entries[0].amount_cents, -5);
        assert_eq!(entries[0].metadata["turn"], 1);
        assert!(entries[1].is_top_up());
        assert_eq!(entries[1].metadata["source"], "card");
    }

    /// Jumps one second forward on every read
    struct TickingClock(Mutex<chrono::DateTime<Utc>>);

    impl Clock for TickingClock {
        fn now(&self) -> chrono::DateTime<Utc> {
            let mut now = self.0.lock();
            let current = *now;
            *now += Duration::seconds(1);
            current
        }
    }

    #[test]
    fn test_charge_at_midnight_prices_and_records_one_day() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(TickingClock(Mutex::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 23, 59, 59).unwrap(),
        )));
        let ledger = CreditLedger::new(store.clone(), PriceTable::defaults(), clock);
        let text = Feature::text(Mode::Standard);

        assert_eq!(ledger.charge_feature("u", "c", text, 1, serde_json::json!({})).unwrap(), 0);

        let day = |d| chrono::NaiveDate::from_ymd_opt(2026, 4, d).unwrap();
        assert_eq!(store.get_daily_usage("u", day(1), text).unwrap(), 1);
        assert_eq!(store.get_daily_usage("u", day(2), text).unwrap(), 0);
    }

    #[test]
    fn test_wallet_locks_released_after_use() {
        let (ledger, _) = ledger_with(PriceTable::defaults());
        let text = Feature::text(Mode::Standard);

        for i in 0..500 {
            let counterparty = format!("cp-{i}");
            ledger.top_up("u", &counterparty, Mode::Standard, 10, "test").unwrap();
            ledger
                .charge_feature("u", &counterparty, text, 1, serde_json::json!({}))
                .unwrap();
        }

        assert_eq!(ledger.wallet_locks.len(), 0);
    }

    #[test]
    fn test_wallet_lock_kept_while_held() {
        let (ledger, _) = ledger_with(PriceTable::defaults());
        let wallet = WalletKey::new("u", "c", Mode::Standard);

        ledger.with_wallet_lock(&wallet, || {
            assert_eq!(ledger.wallet_locks.len(), 1);
            ledger.with_wallet_lock(&WalletKey::new("u", "other", Mode::Standard), || {
                assert_eq!(ledger.wallet_locks.len(), 2);
            });
            assert_eq!(ledger.wallet_locks.len(), 1);
        });
        assert_eq!(ledger.wallet_locks.len(), 0);
    }
}
