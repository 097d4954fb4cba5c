//! Error types for cadence-core
//!
//! One thiserror enum per layer. Everything raised below the orchestrator is
//! folded into a [`TurnError`] before it reaches a client.

use cadence_types::{Feature, UnknownFeature, WalletKey};
use std::path::PathBuf;
use thiserror::Error;

/// Persistence collaborator errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {message}")]
    Sqlite {
        message: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Conditional debit refused: balance would go negative
    #[error("Wallet {key:?} holds {balance_cents} cents, cannot debit {amount_cents}")]
    InsufficientBalance {
        key: WalletKey,
        balance_cents: i64,
        amount_cents: i64,
    },

    /// Optimistic concurrency check failed (version 0 means "not stored yet")
    #[error("Version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Failed to open store at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Failed to encode row")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn sqlite(message: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let message = message.into();
        move |source| StoreError::Sqlite { message, source }
    }
}

/// Credit ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// User-facing: wallet cannot cover the billable units. No mutation happened.
    #[error("Insufficient credits for {feature}: need {needed_cents} cents, have {balance_cents}")]
    InsufficientCredits {
        feature: Feature,
        needed_cents: i64,
        balance_cents: i64,
        free_left: u64,
    },

    #[error(transparent)]
    UnknownFeature(#[from] UnknownFeature),

    #[error("Feature {0} is not active")]
    FeatureInactive(Feature),

    #[error("Pricing not configured for {0}")]
    PricingNotConfigured(Feature),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Ledger store failure")]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn is_insufficient_credits(&self) -> bool {
        matches!(self, LedgerError::InsufficientCredits { .. })
    }
}

/// Failure reported by the external turn executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Turn executor failed: {0}")]
    Failed(String),

    #[error("Turn executor timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Turn executor returned an empty reply")]
    EmptyReply,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error(transparent)]
    UnknownFeature(#[from] UnknownFeature),
}

/// Error delivered to the caller of a turn
///
/// Exactly one of these comes out of a failed flush; raw internal errors never do.
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Insufficient credits: need {needed_cents} cents")]
    InsufficientCredits {
        feature: Feature,
        needed_cents: i64,
        balance_cents: i64,
        free_left: u64,
    },

    #[error("Turn executor failure")]
    TurnExecutorFailure(#[source] ExecutorError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TurnError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            TurnError::TurnExecutorFailure(_) => "TURN_FAILED",
            TurnError::Internal(_) => "SYSTEM_ERROR",
        }
    }

    /// Message safe to show to an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::InsufficientCredits { .. } => {
                "You don't have enough credits. Please top up to continue."
            }
            TurnError::TurnExecutorFailure(_) => "Sorry, something went wrong. Please try again.",
            TurnError::Internal(_) => "Service temporarily unavailable. Please try again.",
        }
    }
}

impl From<LedgerError> for TurnError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredits {
                feature,
                needed_cents,
                balance_cents,
                free_left,
            } => TurnError::InsufficientCredits {
                feature,
                needed_cents,
                balance_cents,
                free_left,
            },
            other => TurnError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::Mode;

    #[test]
    fn test_ledger_insufficient_credits_maps_to_turn_error() {
        let err = LedgerError::InsufficientCredits {
            feature: Feature::text(Mode::Standard),
            needed_cents: 5,
            balance_cents: 3,
            free_left: 0,
        };
        assert!(err.is_insufficient_credits());

        let turn: TurnError = err.into();
        assert_eq!(turn.code(), "INSUFFICIENT_CREDITS");
        assert!(matches!(
            turn,
            TurnError::InsufficientCredits { needed_cents: 5, .. }
        ));
    }

    #[test]
    fn test_other_ledger_errors_become_internal() {
        let err = LedgerError::FeatureInactive(Feature::voice(Mode::Adult));
        let turn: TurnError = err.into();
        assert_eq!(turn.code(), "SYSTEM_ERROR");
        assert!(turn.to_string().contains("voice_18"));
    }
}
