//! SQLite store
//!
//! Schema:
//! - wallets: balance per (user, counterparty, mode), CHECK balance >= 0
//! - daily_usage: units per (user, day, feature)
//! - ledger_entries: append-only audit trail, unique idempotency keys
//! - reconciliations: charges lost after their reply was delivered
//! - relationships: versioned state per (subject, counterparty)
//!
//! A charge runs in one transaction with a conditional `UPDATE ... WHERE
//! balance_cents >= ?` so two processes sharing the file cannot overdraw.

use super::{ChargeCommit, LedgerStore, PendingReconciliation, RelationshipStore, StoreResult};
use crate::error::StoreError;
use crate::scorer::{RelationshipKey, RelationshipState};
use cadence_types::{ConversationId, Feature, LedgerEntry, Mode, WalletKey};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Bump when the schema changes incompatibly
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS wallets (
        user_id TEXT NOT NULL,
        counterparty_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        balance_cents INTEGER NOT NULL CHECK (balance_cents >= 0),
        PRIMARY KEY (user_id, counterparty_id, mode)
    );

    CREATE TABLE IF NOT EXISTS daily_usage (
        user_id TEXT NOT NULL,
        day TEXT NOT NULL,
        feature TEXT NOT NULL,
        units INTEGER NOT NULL,
        PRIMARY KEY (user_id, day, feature)
    );

    CREATE TABLE IF NOT EXISTS ledger_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        counterparty_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        feature TEXT,
        units INTEGER NOT NULL,
        amount_cents INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        idempotency_key TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(user_id, counterparty_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_idempotency
        ON ledger_entries(idempotency_key) WHERE idempotency_key IS NOT NULL;

    CREATE TABLE IF NOT EXISTS reconciliations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        counterparty_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        feature TEXT NOT NULL,
        units INTEGER NOT NULL,
        error TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS relationships (
        subject_id TEXT NOT NULL,
        counterparty_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        score REAL NOT NULL,
        last_interaction_at TEXT,
        data TEXT NOT NULL,
        PRIMARY KEY (subject_id, counterparty_id)
    );
"#;

/// SQLite-backed store (thread-safe)
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Create or open the database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: path.to_path_buf(),
                message: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::sqlite("Failed to enable WAL mode"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(StoreError::sqlite("Failed to set busy timeout"))?;

        let store = Self::init(conn, Some(path.to_path_buf()))?;
        debug!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Private database, gone when dropped
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::sqlite("Failed to open in-memory database"))?;
        Self::init(conn, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(StoreError::sqlite("Failed to create schema"))?;

        let stored: Option<i64> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::sqlite("Failed to query schema version"))?;

        match stored {
            None => {
                conn.execute(
                    "INSERT INTO schema_meta (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION],
                )
                .map_err(StoreError::sqlite("Failed to initialize schema version"))?;
                debug!(version = SCHEMA_VERSION, "Schema version initialized");
            }
            Some(v) if v != SCHEMA_VERSION => {
                // Ledger data is never discarded; refuse to run against it instead
                return Err(StoreError::Open {
                    path: path.unwrap_or_default(),
                    message: format!("schema version {} (expected {})", v, SCHEMA_VERSION),
                });
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

fn read_balance(conn: &Connection, wallet: &WalletKey) -> StoreResult<i64> {
    let balance: Option<i64> = conn
        .query_row(
            "SELECT balance_cents FROM wallets WHERE user_id = ? AND counterparty_id = ? AND mode = ?",
            params![wallet.user_id, wallet.counterparty_id, wallet.mode.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::sqlite("Failed to read wallet"))?;
    Ok(balance.unwrap_or(0))
}

fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> StoreResult<()> {
    let metadata = serde_json::to_string(&entry.metadata)?;
    conn.execute(
        r#"
        INSERT INTO ledger_entries
        (user_id, counterparty_id, mode, feature, units, amount_cents, metadata, idempotency_key, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            entry.user_id,
            entry.counterparty_id,
            entry.mode.as_str(),
            entry.feature.map(|f| f.id()),
            entry.units,
            entry.amount_cents,
            metadata,
            entry.idempotency_key,
            entry.created_at.to_rfc3339(),
        ],
    )
    .map_err(StoreError::sqlite("Failed to append ledger entry"))?;
    Ok(())
}

/// Raw ledger row before validation
struct EntryRow {
    user_id: String,
    counterparty_id: String,
    mode: String,
    feature: Option<String>,
    units: i64,
    amount_cents: i64,
    metadata: String,
    idempotency_key: Option<String>,
    created_at: String,
}

const ENTRY_COLUMNS: &str =
    "user_id, counterparty_id, mode, feature, units, amount_cents, metadata, idempotency_key, created_at";

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            counterparty_id: row.get(1)?,
            mode: row.get(2)?,
            feature: row.get(3)?,
            units: row.get(4)?,
            amount_cents: row.get(5)?,
            metadata: row.get(6)?,
            idempotency_key: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> StoreResult<LedgerEntry> {
        let corrupt = |message: String| StoreError::Corrupt {
            table: "ledger_entries",
            message,
        };
        Ok(LedgerEntry {
            user_id: self.user_id,
            counterparty_id: self.counterparty_id,
            mode: parse_mode(&self.mode).map_err(corrupt)?,
            feature: self
                .feature
                .map(|f| f.parse::<Feature>())
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?,
            units: self.units,
            amount_cents: self.amount_cents,
            metadata: serde_json::from_str(&self.metadata).map_err(|e| corrupt(e.to_string()))?,
            idempotency_key: self.idempotency_key,
            created_at: parse_time(&self.created_at).map_err(corrupt)?,
        })
    }
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    s.parse::<Mode>().map_err(|e| e.to_string())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {:?}: {}", s, e))
}

impl LedgerStore for SqliteStore {
    fn get_wallet(&self, wallet: &WalletKey) -> StoreResult<i64> {
        let conn = self.lock()?;
        read_balance(&conn, wallet)
    }

    fn get_daily_usage(&self, user_id: &str, day: NaiveDate, feature: Feature) -> StoreResult<u64> {
        let conn = self.lock()?;
        let units: Option<i64> = conn
            .query_row(
                "SELECT units FROM daily_usage WHERE user_id = ? AND day = ? AND feature = ?",
                params![user_id, day.to_string(), feature.id()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::sqlite("Failed to read daily usage"))?;
        Ok(units.unwrap_or(0).max(0) as u64)
    }

    fn apply_charge(&self, charge: &ChargeCommit) -> StoreResult<i64> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::sqlite("Failed to begin charge transaction"))?;

        if charge.amount_cents > 0 {
            let debited = tx
                .execute(
                    r#"
                    UPDATE wallets SET balance_cents = balance_cents - ?1
                    WHERE user_id = ?2 AND counterparty_id = ?3 AND mode = ?4 AND balance_cents >= ?1
                    "#,
                    params![
                        charge.amount_cents,
                        charge.wallet.user_id,
                        charge.wallet.counterparty_id,
                        charge.wallet.mode.as_str(),
                    ],
                )
                .map_err(StoreError::sqlite("Failed to debit wallet"))?;

            if debited == 0 {
                // Dropping the transaction rolls it back
                return Err(StoreError::InsufficientBalance {
                    key: charge.wallet.clone(),
                    balance_cents: read_balance(&tx, &charge.wallet)?,
                    amount_cents: charge.amount_cents,
                });
            }
        }

        tx.execute(
            r#"
            INSERT INTO daily_usage (user_id, day, feature, units) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, day, feature) DO UPDATE SET units = units + excluded.units
            "#,
            params![
                charge.wallet.user_id,
                charge.day.to_string(),
                charge.feature.id(),
                charge.units as i64,
            ],
        )
        .map_err(StoreError::sqlite("Failed to increment daily usage"))?;

        insert_entry(&tx, &charge.entry)?;
        let balance = read_balance(&tx, &charge.wallet)?;

        tx.commit()
            .map_err(StoreError::sqlite("Failed to commit charge"))?;
        Ok(balance)
    }

    fn credit_wallet(&self, wallet: &WalletKey, amount_cents: i64, entry: &LedgerEntry) -> StoreResult<i64> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::sqlite("Failed to begin credit transaction"))?;

        tx.execute(
            r#"
            INSERT INTO wallets (user_id, counterparty_id, mode, balance_cents) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, counterparty_id, mode) DO UPDATE SET balance_cents = balance_cents + excluded.balance_cents
            "#,
            params![wallet.user_id, wallet.counterparty_id, wallet.mode.as_str(), amount_cents],
        )
        .map_err(StoreError::sqlite("Failed to credit wallet"))?;

        insert_entry(&tx, entry)?;
        let balance = read_balance(&tx, wallet)?;

        tx.commit()
            .map_err(StoreError::sqlite("Failed to commit credit"))?;
        Ok(balance)
    }

    fn ledger_entries(
        &self,
        user_id: &str,
        counterparty_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE user_id = ?1 AND (?2 IS NULL OR counterparty_id = ?2) ORDER BY id DESC LIMIT ?3",
            ENTRY_COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(StoreError::sqlite("Failed to prepare ledger query"))?;

        let rows = stmt
            .query_map(params![user_id, counterparty_id, limit as i64], EntryRow::from_row)
            .map_err(StoreError::sqlite("Failed to query ledger"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::sqlite("Failed to read ledger row"))?;

        rows.into_iter().map(EntryRow::decode).collect()
    }

    fn find_charge_by_idempotency_key(&self, key: &str) -> StoreResult<Option<LedgerEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE idempotency_key = ? AND feature IS NOT NULL",
            ENTRY_COLUMNS
        );
        conn.query_row(&sql, params![key], EntryRow::from_row)
            .optional()
            .map_err(StoreError::sqlite("Failed to look up idempotency key"))?
            .map(EntryRow::decode)
            .transpose()
    }

    fn record_reconciliation(&self, pending: &PendingReconciliation) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO reconciliations
            (conversation_id, user_id, counterparty_id, mode, feature, units, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                pending.conversation_id.as_str(),
                pending.wallet.user_id,
                pending.wallet.counterparty_id,
                pending.wallet.mode.as_str(),
                pending.feature.id(),
                pending.units as i64,
                pending.error,
                pending.created_at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::sqlite("Failed to record reconciliation"))?;
        Ok(())
    }

    fn pending_reconciliations(&self) -> StoreResult<Vec<PendingReconciliation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, user_id, counterparty_id, mode, feature, units, error, created_at
                 FROM reconciliations ORDER BY id",
            )
            .map_err(StoreError::sqlite("Failed to prepare reconciliation query"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(StoreError::sqlite("Failed to query reconciliations"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::sqlite("Failed to read reconciliation row"))?;

        rows.into_iter()
            .map(|(conversation_id, user_id, counterparty_id, mode, feature, units, error, created_at)| {
                let corrupt = |message: String| StoreError::Corrupt {
                    table: "reconciliations",
                    message,
                };
                Ok(PendingReconciliation {
                    conversation_id: ConversationId::new(conversation_id),
                    wallet: WalletKey::new(user_id, counterparty_id, parse_mode(&mode).map_err(corrupt)?),
                    feature: feature.parse().map_err(|e: cadence_types::UnknownFeature| corrupt(e.to_string()))?,
                    units: units.max(0) as u32,
                    error,
                    created_at: parse_time(&created_at).map_err(corrupt)?,
                })
            })
            .collect()
    }
}

impl RelationshipStore for SqliteStore {
    fn get_relationship_score(&self, key: &RelationshipKey) -> StoreResult<Option<RelationshipState>> {
        let conn = self.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, data FROM relationships WHERE subject_id = ? AND counterparty_id = ?",
                params![key.subject_id, key.counterparty_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::sqlite("Failed to read relationship"))?;

        row.map(|(version, data)| decode_state(version, &data)).transpose()
    }

    fn save_relationship_score(&self, key: &RelationshipKey, state: &RelationshipState) -> StoreResult<u64> {
        let expected = state.version;
        let next = expected + 1;
        let data = serde_json::to_string(state)?;
        let last_interaction = state.last_interaction_at.map(|t| t.to_rfc3339());

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::sqlite("Failed to begin relationship transaction"))?;

        let result = if expected == 0 {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO relationships
                (subject_id, counterparty_id, version, score, last_interaction_at, data)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![key.subject_id, key.counterparty_id, next as i64, state.score, last_interaction, data],
            )
        } else {
            tx.execute(
                r#"
                UPDATE relationships SET version = ?, score = ?, last_interaction_at = ?, data = ?
                WHERE subject_id = ? AND counterparty_id = ? AND version = ?
                "#,
                params![
                    next as i64,
                    state.score,
                    last_interaction,
                    data,
                    key.subject_id,
                    key.counterparty_id,
                    expected as i64
                ],
            )
        };
        let written = result.map_err(StoreError::sqlite("Failed to save relationship"))?;

        if written == 0 {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT version FROM relationships WHERE subject_id = ? AND counterparty_id = ?",
                    params![key.subject_id, key.counterparty_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::sqlite("Failed to read relationship version"))?;
            return Err(StoreError::VersionConflict {
                expected,
                found: found.unwrap_or(0).max(0) as u64,
            });
        }

        tx.commit()
            .map_err(StoreError::sqlite("Failed to commit relationship"))?;
        Ok(next)
    }

    fn list_relationships(&self) -> StoreResult<Vec<(RelationshipKey, RelationshipState)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT subject_id, counterparty_id, version, data FROM relationships
                 ORDER BY subject_id, counterparty_id",
            )
            .map_err(StoreError::sqlite("Failed to prepare relationship query"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(StoreError::sqlite("Failed to query relationships"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::sqlite("Failed to read relationship row"))?;

        rows.into_iter()
            .map(|(subject, counterparty, version, data)| {
                Ok((RelationshipKey::new(subject, counterparty), decode_state(version, &data)?))
            })
            .collect()
    }
}

fn decode_state(version: i64, data: &str) -> StoreResult<RelationshipState> {
    let mut state: RelationshipState = serde_json::from_str(data).map_err(|e| StoreError::Corrupt {
        table: "relationships",
        message: e.to_string(),
    })?;
    // Column is authoritative; the JSON copy lags by one write
    state.version = version.max(0) as u64;
    Ok(state)
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if self.path.is_none() {
            return;
        }
        // Keep the WAL file from growing across restarts
        if let Ok(conn) = self.conn.lock() {
            if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
                warn!("Failed to checkpoint WAL on SqliteStore drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use tempfile::tempdir;

    #[test]
    fn test_charge_is_all_or_nothing() {
        contract::charge_is_all_or_nothing(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_free_charge_on_empty_wallet() {
        contract::free_charge_on_empty_wallet(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_reconciliations() {
        contract::reconciliations_round_trip(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_relationship_versioning() {
        contract::relationship_versioning(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cadence.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .credit_wallet(&contract::wallet(), 40, &contract::entry(40, None, None))
                .unwrap();
            store.apply_charge(&contract::charge(5, Some("turn-1"))).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_wallet(&contract::wallet()).unwrap(), 35);
        assert!(store.find_charge_by_idempotency_key("turn-1").unwrap().is_some());
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn test_duplicate_idempotency_key_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .credit_wallet(&contract::wallet(), 40, &contract::entry(40, None, None))
            .unwrap();
        store.apply_charge(&contract::charge(5, Some("dup"))).unwrap();

        let err = store.apply_charge(&contract::charge(5, Some("dup"))).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite { .. }));
        // Debit from the failed attempt was rolled back
        assert_eq!(store.get_wallet(&contract::wallet()).unwrap(), 35);
    }
}
