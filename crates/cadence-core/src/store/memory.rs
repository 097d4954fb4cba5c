//! In-memory store
//!
//! Ledger state sits behind one parking_lot mutex so a charge's three writes
//! are observed together. Relationships live in a DashMap; the version check
//! and write happen under the entry's shard lock.

use super::{ChargeCommit, LedgerStore, PendingReconciliation, RelationshipStore, StoreResult};
use crate::error::StoreError;
use crate::scorer::{RelationshipKey, RelationshipState};
use cadence_types::{Feature, LedgerEntry, WalletKey};
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct LedgerTables {
    wallets: HashMap<WalletKey, i64>,
    usage: HashMap<(String, NaiveDate, Feature), u64>,
    entries: Vec<LedgerEntry>,
    reconciliations: Vec<PendingReconciliation>,
}

/// Process-local store; nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    ledger: Mutex<LedgerTables>,
    relationships: DashMap<RelationshipKey, RelationshipState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn get_wallet(&self, wallet: &WalletKey) -> StoreResult<i64> {
        Ok(self.ledger.lock().wallets.get(wallet).copied().unwrap_or(0))
    }

    fn get_daily_usage(&self, user_id: &str, day: NaiveDate, feature: Feature) -> StoreResult<u64> {
        let tables = self.ledger.lock();
        Ok(tables
            .usage
            .get(&(user_id.to_string(), day, feature))
            .copied()
            .unwrap_or(0))
    }

    fn apply_charge(&self, charge: &ChargeCommit) -> StoreResult<i64> {
        let mut tables = self.ledger.lock();

        let balance = tables.wallets.get(&charge.wallet).copied().unwrap_or(0);
        if charge.amount_cents > balance {
            return Err(StoreError::InsufficientBalance {
                key: charge.wallet.clone(),
                balance_cents: balance,
                amount_cents: charge.amount_cents,
            });
        }

        let new_balance = balance - charge.amount_cents;
        tables.wallets.insert(charge.wallet.clone(), new_balance);
        *tables
            .usage
            .entry((charge.wallet.user_id.clone(), charge.day, charge.feature))
            .or_insert(0) += charge.units as u64;
        tables.entries.push(charge.entry.clone());

        Ok(new_balance)
    }

    fn credit_wallet(&self, wallet: &WalletKey, amount_cents: i64, entry: &LedgerEntry) -> StoreResult<i64> {
        let mut tables = self.ledger.lock();
        let balance = tables.wallets.entry(wallet.clone()).or_insert(0);
        *balance += amount_cents;
        let new_balance = *balance;
        tables.entries.push(entry.clone());
        Ok(new_balance)
    }

    fn ledger_entries(
        &self,
        user_id: &str,
        counterparty_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let tables = self.ledger.lock();
        Ok(tables
            .entries
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .filter(|e| counterparty_id.is_none_or(|cp| e.counterparty_id == cp))
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_charge_by_idempotency_key(&self, key: &str) -> StoreResult<Option<LedgerEntry>> {
        let tables = self.ledger.lock();
        Ok(tables
            .entries
            .iter()
            .find(|e| !e.is_top_up() && e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    fn record_reconciliation(&self, pending: &PendingReconciliation) -> StoreResult<()> {
        self.ledger.lock().reconciliations.push(pending.clone());
        Ok(())
    }

    fn pending_reconciliations(&self) -> StoreResult<Vec<PendingReconciliation>> {
        Ok(self.ledger.lock().reconciliations.clone())
    }
}

impl RelationshipStore for MemoryStore {
    fn get_relationship_score(&self, key: &RelationshipKey) -> StoreResult<Option<RelationshipState>> {
        Ok(self.relationships.get(key).map(|r| r.value().clone()))
    }

    fn save_relationship_score(&self, key: &RelationshipKey, state: &RelationshipState) -> StoreResult<u64> {
        let expected = state.version;
        match self.relationships.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let found = occupied.get().version;
                if found != expected {
                    return Err(StoreError::VersionConflict { expected, found });
                }
                let mut next = state.clone();
                next.version = found + 1;
                occupied.insert(next);
                Ok(found + 1)
            }
            Entry::Vacant(vacant) => {
                if expected != 0 {
                    return Err(StoreError::VersionConflict { expected, found: 0 });
                }
                let mut next = state.clone();
                next.version = 1;
                vacant.insert(next);
                Ok(1)
            }
        }
    }

    fn list_relationships(&self) -> StoreResult<Vec<(RelationshipKey, RelationshipState)>> {
        let mut all: Vec<_> = self
            .relationships
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn test_charge_is_all_or_nothing() {
        contract::charge_is_all_or_nothing(&MemoryStore::new());
    }

    #[test]
    fn test_free_charge_on_empty_wallet() {
        contract::free_charge_on_empty_wallet(&MemoryStore::new());
    }

    #[test]
    fn test_reconciliations() {
        contract::reconciliations_round_trip(&MemoryStore::new());
    }

    #[test]
    fn test_relationship_versioning() {
        contract::relationship_versioning(&MemoryStore::new());
    }

    #[test]
    fn test_ledger_entries_filter_and_order() {
        let store = MemoryStore::new();
        let wallet = contract::wallet();
        store.credit_wallet(&wallet, 100, &contract::entry(100, None, None)).unwrap();
        store.apply_charge(&contract::charge(5, None)).unwrap();

        let entries = store.ledger_entries("u-1", Some("cp-1"), 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_top_up());
        assert!(entries[1].is_top_up());

        assert!(store.ledger_entries("u-1", Some("cp-2"), 10).unwrap().is_empty());
        assert_eq!(store.ledger_entries("u-1", None, 1).unwrap().len(), 1);
    }
}
