//! Event bus for cadence using tokio::broadcast
//!
//! Lifecycle notifications for turns. Observers (CLI, reconciliation workers,
//! tests) subscribe; the core never waits on them.

use cadence_types::{ConversationId, Feature, WalletKey};
use tokio::sync::broadcast;

/// Why a buffer was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Debounce window elapsed after the last fragment
    Debounce,
    /// Fragment ended a thought
    EndOfThought,
    /// Client asked for it (explicit `final` or disconnect)
    Final,
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Debounce timer (re)armed for a conversation
    FlushScheduled(ConversationId),
    /// A drained batch is about to go through the executor
    TurnStarted {
        conversation_id: ConversationId,
        reason: FlushReason,
    },
    /// Reply delivered
    TurnCompleted {
        conversation_id: ConversationId,
        charged_cents: i64,
    },
    /// Turn ended in a typed error
    TurnFailed {
        conversation_id: ConversationId,
        code: &'static str,
    },
    /// Reply was delivered but the charge could not be recorded
    ReconciliationNeeded {
        conversation_id: ConversationId,
        wallet: WalletKey,
        feature: Feature,
        units: u32,
    },
    /// Idle buffer dropped from the registry
    ConversationEvicted(ConversationId),
}

impl TurnEvent {
    /// Conversation the event is about
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            TurnEvent::FlushScheduled(id) | TurnEvent::ConversationEvicted(id) => id,
            TurnEvent::TurnStarted { conversation_id, .. }
            | TurnEvent::TurnCompleted { conversation_id, .. }
            | TurnEvent::TurnFailed { conversation_id, .. }
            | TurnEvent::ReconciliationNeeded { conversation_id, .. } => conversation_id,
        }
    }
}

/// Broadcast fan-out of [`TurnEvent`]s
///
/// Publishing never blocks. A subscriber that falls more than the channel
/// capacity behind sees `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TurnEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: TurnEvent) {
        // Nobody listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
