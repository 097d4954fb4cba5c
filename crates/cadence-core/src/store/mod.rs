//! Persistence collaborators
//!
//! The ledger and the scorer only see these two traits. Every method is atomic
//! on its own; [`LedgerStore::apply_charge`] is the one multi-write operation
//! and must commit all of its writes or none of them.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::scorer::{RelationshipKey, RelationshipState};
use cadence_types::{ConversationId, Feature, LedgerEntry, WalletKey};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type StoreResult<T> = Result<T, StoreError>;

/// One atomic charge: conditional debit, usage increment, audit entry
#[derive(Debug, Clone)]
pub struct ChargeCommit {
    pub wallet: WalletKey,
    pub day: NaiveDate,
    pub feature: Feature,
    pub units: u32,
    /// Amount to debit; the debit is refused if the balance is lower
    pub amount_cents: i64,
    pub entry: LedgerEntry,
}

/// A charge that could not be recorded after its reply was delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReconciliation {
    pub conversation_id: ConversationId,
    pub wallet: WalletKey,
    pub feature: Feature,
    pub units: u32,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Wallets, daily usage counters and the append-only ledger
pub trait LedgerStore: Send + Sync {
    /// Balance in cents; unknown wallets hold 0
    fn get_wallet(&self, wallet: &WalletKey) -> StoreResult<i64>;

    /// Units of `feature` consumed by `user_id` on `day`
    fn get_daily_usage(&self, user_id: &str, day: NaiveDate, feature: Feature) -> StoreResult<u64>;

    /// Apply a charge atomically, returning the new balance
    ///
    /// Fails with [`StoreError::InsufficientBalance`] (and writes nothing) when
    /// the wallet cannot cover `amount_cents`.
    fn apply_charge(&self, charge: &ChargeCommit) -> StoreResult<i64>;

    /// Credit a wallet and append `entry` atomically, returning the new balance
    fn credit_wallet(&self, wallet: &WalletKey, amount_cents: i64, entry: &LedgerEntry) -> StoreResult<i64>;

    /// Most recent entries first
    fn ledger_entries(
        &self,
        user_id: &str,
        counterparty_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<LedgerEntry>>;

    fn find_charge_by_idempotency_key(&self, key: &str) -> StoreResult<Option<LedgerEntry>>;

    fn record_reconciliation(&self, pending: &PendingReconciliation) -> StoreResult<()>;

    fn pending_reconciliations(&self) -> StoreResult<Vec<PendingReconciliation>>;
}

/// Relationship state keyed by (subject, counterparty)
pub trait RelationshipStore: Send + Sync {
    fn get_relationship_score(&self, key: &RelationshipKey) -> StoreResult<Option<RelationshipState>>;

    /// Save `state` if the stored version still equals `state.version`
    ///
    /// Returns the new version. A missing row counts as version 0.
    fn save_relationship_score(&self, key: &RelationshipKey, state: &RelationshipState) -> StoreResult<u64>;

    fn list_relationships(&self) -> StoreResult<Vec<(RelationshipKey, RelationshipState)>>;
}
