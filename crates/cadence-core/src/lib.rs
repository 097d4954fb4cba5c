//! cadence-core - Core library for cadence
//!
//! Per-conversation turn orchestration: a debounced turn buffer, a credit
//! ledger with daily free allowances, a relationship scorer, and the
//! orchestrator that drives one turn through all three.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod scorer;
pub mod store;

pub use buffer::{ends_thought, ConversationBinding, FlushDecision, FlushRequest, FragmentMeta, JoinedMessage, TurnBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CadenceConfig;
pub use error::{ConfigError, ExecutorError, LedgerError, StoreError, TurnError};
pub use event::{EventBus, FlushReason, TurnEvent};
pub use executor::{EchoExecutor, TurnExecutor, TurnRequest};
pub use ledger::{Affordability, CreditLedger, PriceTable};
pub use orchestrator::{Dispatcher, Orchestrator, Session};
pub use scorer::{RelationshipKey, RelationshipScorer, RelationshipState};
pub use store::{LedgerStore, MemoryStore, PendingReconciliation, RelationshipStore, SqliteStore};
