//! Turn orchestrator
//!
//! Drives one turn per drained buffer:
//!
//! 1. take the conversation's turn gate and drain the buffer (empty: no-op)
//! 2. pre-check affordability, refusing before the executor runs
//! 3. call the executor outside every buffer lock, bounded by a timeout
//! 4. charge, then update the relationship, then deliver
//!
//! Every failure is folded into one [`TurnError`] and delivered as an
//! [`OutboundMessage::Error`]. A charge that fails after the reply exists is
//! not an error for the caller: the reply goes out with `billing_pending` and
//! the charge is queued for reconciliation.

use crate::buffer::{ConversationBinding, FlushDecision, FlushRequest, FragmentMeta, JoinedMessage, TurnBuffer};
use crate::clock::Clock;
use crate::config::{CadenceConfig, OrchestratorConfig};
use crate::error::{ConfigError, ExecutorError, LedgerError, TurnError};
use crate::event::{EventBus, FlushReason, TurnEvent};
use crate::executor::{TurnExecutor, TurnRequest};
use crate::ledger::{CreditLedger, IDEMPOTENCY_KEY};
use crate::scorer::{tags, RelationshipKey, RelationshipScorer};
use crate::store::{LedgerStore, PendingReconciliation, RelationshipStore};
use cadence_types::{ConversationId, Feature, InboundMessage, OutboundMessage, WalletKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Reply channel registered by an open [`Session`]
struct SessionSink {
    token: u64,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

pub struct Orchestrator {
    buffer: TurnBuffer,
    ledger: Arc<CreditLedger>,
    scorer: Arc<RelationshipScorer>,
    executor: Arc<dyn TurnExecutor>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    sessions: DashMap<ConversationId, SessionSink>,
    /// Parked here while no dispatcher is running
    flush_rx: Mutex<Option<mpsc::UnboundedReceiver<FlushRequest>>>,
    seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        config: &CadenceConfig,
        ledger: Arc<CreditLedger>,
        scorer: Arc<RelationshipScorer>,
        executor: Arc<dyn TurnExecutor>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let (buffer, flush_rx) = TurnBuffer::new(config.buffer.clone(), events.clone());
        Self {
            buffer,
            ledger,
            scorer,
            executor,
            events,
            clock,
            config: config.orchestrator.clone(),
            sessions: DashMap::new(),
            flush_rx: Mutex::new(Some(flush_rx)),
            seq: AtomicU64::new(0),
        }
    }

    /// Wire ledger and scorer over one store
    pub fn from_config<S>(
        config: &CadenceConfig,
        store: Arc<S>,
        executor: Arc<dyn TurnExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError>
    where
        S: LedgerStore + RelationshipStore + 'static,
    {
        let ledger = Arc::new(CreditLedger::new(store.clone(), config.price_table()?, clock.clone()));
        let scorer = Arc::new(
            RelationshipScorer::new(store, clock.clone(), &config.scorer)
                .with_save_retries(config.orchestrator.score_save_retries),
        );
        Ok(Self::new(config, ledger, scorer, executor, clock, EventBus::default()))
    }

    pub fn buffer(&self) -> &TurnBuffer {
        &self.buffer
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn scorer(&self) -> &Arc<RelationshipScorer> {
        &self.scorer
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a session for a client connection
    ///
    /// Replies for the conversation are delivered to the returned session. A
    /// later `open` for the same conversation takes the replies over.
    pub fn open(self: &Arc<Self>, binding: ConversationBinding, conversation_id: Option<ConversationId>) -> Session {
        let conversation_id = conversation_id.unwrap_or_else(|| {
            ConversationId::new(format!(
                "c-{:x}-{}",
                self.clock.now().timestamp_millis(),
                self.next_seq()
            ))
        });

        let token = self.next_seq();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(conversation_id.clone(), SessionSink { token, tx });
        self.buffer.bind(
            &conversation_id,
            FragmentMeta {
                binding: Some(binding.clone()),
                ..FragmentMeta::default()
            },
        );

        info!(
            conversation_id = %conversation_id,
            user_id = %binding.user_id,
            counterparty_id = %binding.counterparty_id,
            mode = binding.mode.as_str(),
            "Session opened"
        );
        Session {
            conversation_id,
            binding,
            token,
            orchestrator: Arc::clone(self),
            replies: rx,
        }
    }

    fn deliver(&self, conversation_id: &ConversationId, message: OutboundMessage) {
        match self.sessions.get(conversation_id) {
            Some(sink) => {
                if sink.tx.send(message).is_err() {
                    debug!(conversation_id = %conversation_id, "Session receiver gone, reply dropped");
                }
            }
            None => debug!(conversation_id = %conversation_id, "No open session, reply dropped"),
        }
    }

    /// Run one turn for `conversation_id`
    ///
    /// Returns `None` when nothing was pending. Turns for the same
    /// conversation queue behind each other; other conversations are not
    /// blocked.
    pub async fn handle_flush(&self, conversation_id: &ConversationId, reason: FlushReason) -> Option<OutboundMessage> {
        let gate = self.buffer.turn_gate(conversation_id)?;
        let _turn = gate.lock().await;
        self.flush_gated(conversation_id, reason).await
    }

    /// Run one turn and deliver its reply before the gate is released, so
    /// replies for one conversation leave in turn order
    async fn flush_and_deliver(&self, conversation_id: &ConversationId, reason: FlushReason) {
        let Some(gate) = self.buffer.turn_gate(conversation_id) else {
            return;
        };
        let _turn = gate.lock().await;
        if let Some(reply) = self.flush_gated(conversation_id, reason).await {
            self.deliver(conversation_id, reply);
        }
    }

    /// Caller holds the conversation's turn gate
    async fn flush_gated(&self, conversation_id: &ConversationId, reason: FlushReason) -> Option<OutboundMessage> {
        let Some(joined) = self.buffer.flush(conversation_id) else {
            debug!(conversation_id = %conversation_id, ?reason, "Nothing to flush");
            return None;
        };

        info!(
            conversation_id = %conversation_id,
            ?reason,
            fragments = joined.fragment_count,
            "Turn started"
        );
        self.events.publish(TurnEvent::TurnStarted {
            conversation_id: conversation_id.clone(),
            reason,
        });

        let outcome = self.run_turn(&joined).await;
        self.buffer.finish_flush(conversation_id);

        Some(match outcome {
            Ok((message, charged_cents)) => {
                self.events.publish(TurnEvent::TurnCompleted {
                    conversation_id: conversation_id.clone(),
                    charged_cents,
                });
                message
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, code = e.code(), error = %e, "Turn failed");
                self.events.publish(TurnEvent::TurnFailed {
                    conversation_id: conversation_id.clone(),
                    code: e.code(),
                });
                OutboundMessage::error(e.code(), e.user_message())
            }
        })
    }

    /// Feature and units billed for a drained batch
    fn metering(&self, binding: &ConversationBinding, joined: &JoinedMessage) -> (Feature, u32) {
        if binding.is_audio && joined.audio_seconds > 0 {
            (Feature::voice(binding.mode), joined.audio_seconds)
        } else {
            (Feature::text(binding.mode), self.config.text_units_per_turn.max(1))
        }
    }

    async fn run_turn(&self, joined: &JoinedMessage) -> Result<(OutboundMessage, i64), TurnError> {
        let conversation_id = &joined.conversation_id;
        let binding = joined
            .binding
            .as_ref()
            .ok_or_else(|| TurnError::Internal(format!("conversation {} is not bound to a wallet", conversation_id)))?;
        let (feature, units) = self.metering(binding, joined);

        let quote = self
            .ledger
            .can_afford(&binding.user_id, &binding.counterparty_id, feature, units)?;
        if !quote.ok {
            info!(
                conversation_id = %conversation_id,
                feature = %feature,
                cost_cents = quote.cost_cents,
                balance_cents = quote.balance_cents,
                "Turn refused: insufficient credits"
            );
            return Err(TurnError::InsufficientCredits {
                feature,
                needed_cents: quote.cost_cents,
                balance_cents: quote.balance_cents,
                free_left: quote.free_left,
            });
        }

        let reply = self.execute(joined, binding).await.map_err(|e| {
            warn!(conversation_id = %conversation_id, error = %e, "Turn executor failed");
            TurnError::TurnExecutorFailure(e)
        })?;

        let (charged_cents, billing_pending) = match self.charge(joined, binding, feature, units) {
            Ok(amount) => (amount, false),
            Err(e) => {
                self.flag_reconciliation(joined, binding, feature, units, &e);
                (0, true)
            }
        };

        let key = RelationshipKey::new(binding.user_id.clone(), binding.counterparty_id.clone());
        let relationship = self
            .scorer
            .apply_turn(&key, &reply)
            .map_err(|e| warn!(conversation_id = %conversation_id, error = %e, "Relationship update failed"))
            .ok();

        let usage = self
            .ledger
            .usage_snapshot(&binding.user_id, &binding.counterparty_id, binding.mode)
            .map_err(|e| warn!(conversation_id = %conversation_id, error = %e, "Usage snapshot failed"))
            .ok();

        let message = OutboundMessage::Reply {
            reply: tags::strip_tags(&reply),
            usage,
            relationship,
            billing_pending,
        };
        Ok((message, charged_cents))
    }

    async fn execute(&self, joined: &JoinedMessage, binding: &ConversationBinding) -> Result<String, ExecutorError> {
        let request = TurnRequest {
            message: joined.text.clone(),
            conversation_id: joined.conversation_id.clone(),
            user_id: binding.user_id.clone(),
            counterparty_id: binding.counterparty_id.clone(),
            is_audio: binding.is_audio,
            timezone: joined.timezone.clone(),
        };

        let timeout = self.config.executor_timeout();
        match tokio::time::timeout(timeout, self.executor.execute_turn(request)).await {
            Ok(Ok(reply)) if reply.trim().is_empty() => Err(ExecutorError::EmptyReply),
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    fn charge(
        &self,
        joined: &JoinedMessage,
        binding: &ConversationBinding,
        feature: Feature,
        units: u32,
    ) -> Result<i64, LedgerError> {
        let turn_key = format!(
            "turn:{}:{}:{}",
            joined.conversation_id,
            self.clock.now().timestamp_micros(),
            self.next_seq()
        );
        let mut metadata = serde_json::Map::new();
        metadata.insert(IDEMPOTENCY_KEY.to_string(), turn_key.into());
        metadata.insert("conversation_id".to_string(), joined.conversation_id.as_str().into());
        metadata.insert("fragments".to_string(), joined.fragment_count.into());

        self.ledger.charge_feature(
            &binding.user_id,
            &binding.counterparty_id,
            feature,
            units,
            serde_json::Value::Object(metadata),
        )
    }

    fn flag_reconciliation(
        &self,
        joined: &JoinedMessage,
        binding: &ConversationBinding,
        feature: Feature,
        units: u32,
        cause: &LedgerError,
    ) {
        let wallet = WalletKey::new(binding.user_id.clone(), binding.counterparty_id.clone(), binding.mode);
        error!(
            conversation_id = %joined.conversation_id,
            feature = %feature,
            units,
            error = %cause,
            "Billing failed after reply"
        );

        let pending = PendingReconciliation {
            conversation_id: joined.conversation_id.clone(),
            wallet: wallet.clone(),
            feature,
            units,
            error: cause.to_string(),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.ledger.record_reconciliation(&pending) {
            error!(conversation_id = %joined.conversation_id, error = %e, "Failed to persist reconciliation record");
        }

        self.events.publish(TurnEvent::ReconciliationNeeded {
            conversation_id: joined.conversation_id.clone(),
            wallet,
            feature,
            units,
        });
    }

    /// Start the flush dispatcher and the idle sweeper
    ///
    /// Each flush request runs on its own task. Fails if a dispatcher is
    /// already running.
    pub fn run(self: &Arc<Self>) -> Result<Dispatcher, TurnError> {
        let mut flush_rx = self
            .flush_rx
            .lock()
            .take()
            .ok_or_else(|| TurnError::Internal("dispatcher already running".to_string()))?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(this.buffer.config().sweep_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Turn dispatcher started");
            loop {
                tokio::select! {
                    Some(request) = flush_rx.recv() => {
                        let orchestrator = Arc::clone(&this);
                        tokio::spawn(async move {
                            let FlushRequest { conversation_id, reason } = request;
                            orchestrator.flush_and_deliver(&conversation_id, reason).await;
                        });
                    }
                    _ = sweep.tick() => {
                        this.buffer.sweep();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Turn dispatcher shutting down");
                        break;
                    }
                }
            }
            flush_rx
        });

        Ok(Dispatcher {
            orchestrator: Arc::clone(self),
            shutdown_tx,
            task,
        })
    }
}

/// Handle on a running dispatcher
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<mpsc::UnboundedReceiver<FlushRequest>>,
}

impl Dispatcher {
    /// Stop dispatching and sweeping
    ///
    /// Pending debounce timers are abandoned; turns already running finish on
    /// their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        self.orchestrator.buffer.cancel_all();
        match self.task.await {
            Ok(flush_rx) => *self.orchestrator.flush_rx.lock() = Some(flush_rx),
            Err(e) => error!(error = %e, "Turn dispatcher task failed"),
        }
    }
}

/// One client connection to a conversation
///
/// Dropping the session is a disconnect: whatever is buffered gets a final
/// flush, and its reply is discarded.
pub struct Session {
    conversation_id: ConversationId,
    binding: ConversationBinding,
    token: u64,
    orchestrator: Arc<Orchestrator>,
    replies: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Session {
    pub fn id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn binding(&self) -> &ConversationBinding {
        &self.binding
    }

    /// Queue an inbound fragment; `final` forces a flush of the whole batch
    pub fn submit(&self, message: InboundMessage) -> FlushDecision {
        let buffer = &self.orchestrator.buffer;
        let meta = FragmentMeta {
            timezone: message.timezone,
            binding: Some(self.binding.clone()),
            audio_seconds: message.audio_seconds.unwrap_or(0),
        };

        let decision = buffer.enqueue(&self.conversation_id, &message.message, meta);
        if message.is_final && decision != FlushDecision::FlushedImmediately {
            buffer.request_flush(&self.conversation_id, FlushReason::Final);
            return FlushDecision::FlushedImmediately;
        }
        decision
    }

    /// Next turn result; `None` once the orchestrator is gone
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.replies.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        self.replies.try_recv().ok()
    }

    /// Disconnect (same as dropping)
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        let orchestrator = &self.orchestrator;
        orchestrator
            .sessions
            .remove_if(&self.conversation_id, |_, sink| sink.token == self.token);
        if orchestrator.buffer.pending(&self.conversation_id) > 0 {
            orchestrator
                .buffer
                .request_flush(&self.conversation_id, FlushReason::Final);
        }
        debug!(conversation_id = %self.conversation_id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::{Scripted, ScriptedExecutor};
    use crate::store::MemoryStore;
    use cadence_types::{FeatureKind, Mode};
    use chrono::{TimeZone, Utc};

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        executor: Arc<ScriptedExecutor>,
    }

    fn harness(executor: ScriptedExecutor) -> Harness {
        harness_with(CadenceConfig::default(), Arc::new(MemoryStore::new()), executor)
    }

    fn harness_with<S>(config: CadenceConfig, store: Arc<S>, executor: ScriptedExecutor) -> Harness
    where
        S: LedgerStore + RelationshipStore + 'static,
    {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 18, 0, 0).unwrap()));
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::from_config(&config, store, executor.clone(), clock).unwrap();
        Harness {
            orchestrator: Arc::new(orchestrator),
            executor,
        }
    }

    fn binding() -> ConversationBinding {
        ConversationBinding::text("u-1", "cp-1", Mode::Standard)
    }

    fn queue(orchestrator: &Orchestrator, id: &ConversationId, text: &str) {
        orchestrator.buffer.enqueue(
            id,
            text,
            FragmentMeta {
                binding: Some(binding()),
                ..FragmentMeta::default()
            },
        );
    }

    fn paid_text_config() -> CadenceConfig {
        CadenceConfig::from_toml(
            r#"
            [pricing.text]
            unit = "message"
            price_cents = 5
            free_allowance = 0
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_turn() {
        let h = harness(ScriptedExecutor::replying("Doing great! [Lollity Score: 70/100]"));
        let id = ConversationId::from("c-1");
        queue(&h.orchestrator, &id, "how are you?");

        let reply = h.orchestrator.handle_flush(&id, FlushReason::EndOfThought).await.unwrap();
        match reply {
            OutboundMessage::Reply {
                reply,
                usage,
                relationship,
                billing_pending,
            } => {
                assert_eq!(reply, "Doing great!");
                assert!(!billing_pending);
                let usage = usage.unwrap();
                assert_eq!(usage.feature(FeatureKind::Text).unwrap().used, 1);
                let relationship = relationship.unwrap();
                assert_eq!(relationship.score, 50.5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let calls = h.executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].message, "how are you?");
        assert_eq!(calls[0].user_id, "u-1");
        assert_eq!(h.orchestrator.buffer.phase(&id), Some(crate::buffer::Phase::Idle));
    }

    #[tokio::test]
    async fn test_empty_buffer_is_silent() {
        let h = harness(ScriptedExecutor::default());
        assert!(h
            .orchestrator
            .handle_flush(&ConversationId::from("nobody"), FlushReason::Debounce)
            .await
            .is_none());

        let id = ConversationId::from("c-1");
        queue(&h.orchestrator, &id, "hi");
        assert!(h.orchestrator.handle_flush(&id, FlushReason::Final).await.is_some());
        assert!(h.orchestrator.handle_flush(&id, FlushReason::Final).await.is_none());
        assert_eq!(h.executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_credits_skips_executor() {
        let h = harness_with(paid_text_config(), Arc::new(MemoryStore::new()), ScriptedExecutor::default());
        let id = ConversationId::from("c-1");
        queue(&h.orchestrator, &id, "hello?");

        let reply = h.orchestrator.handle_flush(&id, FlushReason::EndOfThought).await.unwrap();
        assert_eq!(
            reply,
            OutboundMessage::error(
                "INSUFFICIENT_CREDITS",
                "You don't have enough credits. Please top up to continue."
            )
        );
        assert_eq!(h.executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_executor_failure_charges_nothing() {
        let h = harness_with(
            paid_text_config(),
            Arc::new(MemoryStore::new()),
            ScriptedExecutor::failing("model offline"),
        );
        let wallet = WalletKey::new("u-1", "cp-1", Mode::Standard);
        h.orchestrator.ledger.top_up("u-1", "cp-1", Mode::Standard, 100, "test").unwrap();

        let id = ConversationId::from("c-1");
        queue(&h.orchestrator, &id, "hello?");
        let reply = h.orchestrator.handle_flush(&id, FlushReason::EndOfThought).await.unwrap();

        assert!(matches!(&reply, OutboundMessage::Error { code, .. } if code == "TURN_FAILED"));
        assert_eq!(h.orchestrator.ledger.balance(&wallet).unwrap(), 100);
        let key = RelationshipKey::new("u-1", "cp-1");
        assert_eq!(h.orchestrator.scorer.load(&key).unwrap().version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_timeout() {
        let mut config = CadenceConfig::default();
        config.orchestrator.executor_timeout_secs = 1;
        let h = harness_with(
            config,
            Arc::new(MemoryStore::new()),
            ScriptedExecutor::new([Scripted::Delayed(std::time::Duration::from_secs(5), "late".into())]),
        );
        let id = ConversationId::from("c-1");
        queue(&h.orchestrator, &id, "anyone?");

        let reply = h.orchestrator.handle_flush(&id, FlushReason::EndOfThought).await.unwrap();
        assert!(matches!(reply, OutboundMessage::Error { code, .. } if code == "TURN_FAILED"));
    }

    #[tokio::test]
    async fn test_unbound_conversation_is_internal_error() {
        let h = harness(ScriptedExecutor::default());
        let id = ConversationId::from("c-1");
        h.orchestrator.buffer.enqueue(&id, "hi.", FragmentMeta::default());

        let reply = h.orchestrator.handle_flush(&id, FlushReason::EndOfThought).await.unwrap();
        assert!(matches!(reply, OutboundMessage::Error { code, .. } if code == "SYSTEM_ERROR"));
        assert_eq!(h.executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_session_delivers_replies_through_dispatcher() {
        let h = harness(ScriptedExecutor::replying("hi there"));
        let dispatcher = h.orchestrator.run().unwrap();
        assert!(h.orchestrator.run().is_err());

        let mut session = h.orchestrator.open(binding(), Some(ConversationId::from("c-7")));
        assert_eq!(session.submit(InboundMessage::text("hey")), FlushDecision::Scheduled);
        let decision = session.submit(InboundMessage {
            message: "you".to_string(),
            is_final: true,
            ..Default::default()
        });
        assert_eq!(decision, FlushDecision::FlushedImmediately);

        let reply = session.recv().await.unwrap();
        assert_eq!(reply.reply_text(), Some("hi there"));
        assert_eq!(h.executor.calls()[0].message, "hey you");

        dispatcher.shutdown().await;
        // Receiver is parked again, so the dispatcher can restart
        let dispatcher = h.orchestrator.run().unwrap();
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_generated_conversation_ids_are_unique() {
        let h = harness(ScriptedExecutor::default());
        let a = h.orchestrator.open(binding(), None);
        let b = h.orchestrator.open(binding(), None);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_delivered_in_turn_order() {
        let h = harness(ScriptedExecutor::new([
            Scripted::Delayed(std::time::Duration::from_secs(2), "first".into()),
            Scripted::Reply("second".into()),
        ]));
        let dispatcher = h.orchestrator.run().unwrap();
        let mut session = h.orchestrator.open(binding(), Some(ConversationId::from("c-1")));

        session.submit(InboundMessage::text("one."));
        // First turn holds the gate before the second request arrives
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        session.submit(InboundMessage::text("two."));

        assert_eq!(session.recv().await.unwrap().reply_text(), Some("first"));
        assert_eq!(session.recv().await.unwrap().reply_text(), Some("second"));
        assert_eq!(h.executor.call_count(), 2);
        dispatcher.shutdown().await;
    }
}
