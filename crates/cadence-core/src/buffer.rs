//! Turn buffer: per-conversation fragment coalescing
//!
//! Each conversation gets a slot in a DashMap registry. A slot holds the
//! pending fragments, the captured metadata, its phase and a debounce timer.
//! Timers are generation-stamped: every new fragment or flush bumps the
//! generation, so a timer that lost the race to a newer event does nothing
//! even if it already woke up.
//!
//! The buffer never runs a turn itself. When a batch is ready (debounce
//! elapsed, end of thought, or an explicit final) it emits a [`FlushRequest`]
//! on a channel and the orchestrator drains the slot under its turn gate.
//!
//! Slot lifecycle: `Idle → Buffering → Flushing → (Idle | Buffering)`. Idle
//! slots are evicted after `idle_ttl`, or earliest-first once
//! `max_conversations` is reached; slots with fragments or a turn in flight
//! are never evicted.

use crate::config::BufferConfig;
use crate::event::{EventBus, FlushReason, TurnEvent};
use cadence_types::{ConversationId, Mode};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Characters that close a thought
const TERMINAL_PUNCTUATION: [char; 4] = ['.', '!', '?', '…'];

/// Emoji that close a thought
const TERMINAL_EMOJI: [&str; 7] = ["👍", "😉", "😂", "😅", "🤣", "😍", "😘"];

/// Whether `fragment` reads as a complete thought
pub fn ends_thought(fragment: &str) -> bool {
    let text = fragment.trim();
    if text.is_empty() {
        return false;
    }
    text.ends_with(TERMINAL_PUNCTUATION) || TERMINAL_EMOJI.iter().any(|e| text.ends_with(e))
}

/// Who a conversation's turns are billed and scored against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationBinding {
    pub user_id: String,
    pub counterparty_id: String,
    pub mode: Mode,
    /// Turns are voice notes (billed per second) rather than text
    pub is_audio: bool,
}

impl ConversationBinding {
    pub fn text(user_id: impl Into<String>, counterparty_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            user_id: user_id.into(),
            counterparty_id: counterparty_id.into(),
            mode,
            is_audio: false,
        }
    }
}

/// Side metadata captured with a fragment; later values win
#[derive(Debug, Clone, Default)]
pub struct FragmentMeta {
    pub timezone: Option<String>,
    pub binding: Option<ConversationBinding>,
    /// Voice duration carried by this fragment; summed across the batch
    pub audio_seconds: u32,
}

/// Outcome of [`TurnBuffer::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Debounce timer (re)armed
    Scheduled,
    /// Fragment ended a thought; a flush was requested right away
    FlushedImmediately,
    /// Empty or whitespace-only fragment, nothing queued
    Ignored,
}

/// Ask the orchestrator to drain a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    pub conversation_id: ConversationId,
    pub reason: FlushReason,
}

/// Drained batch
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedMessage {
    pub conversation_id: ConversationId,
    /// Fragments in arrival order, joined with single spaces
    pub text: String,
    pub fragment_count: usize,
    pub audio_seconds: u32,
    pub timezone: Option<String>,
    pub binding: Option<ConversationBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Buffering,
    Flushing,
}

struct SlotState {
    fragments: Vec<String>,
    audio_seconds: u32,
    timezone: Option<String>,
    binding: Option<ConversationBinding>,
    phase: Phase,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    last_activity: Instant,
    /// Removed from the registry; writers must retry on a fresh slot
    evicted: bool,
}

impl SlotState {
    fn new() -> Self {
        Self {
            fragments: Vec::new(),
            audio_seconds: 0,
            timezone: None,
            binding: None,
            phase: Phase::Idle,
            timer: None,
            generation: 0,
            last_activity: Instant::now(),
            evicted: false,
        }
    }

    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }

    fn evictable(&self) -> bool {
        self.phase == Phase::Idle && self.fragments.is_empty() && self.timer.is_none()
    }
}

struct Slot {
    state: Mutex<SlotState>,
    /// Held for the whole turn so turns for one conversation never overlap
    turn_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::new()),
            turn_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn idle_and_unlocked(&self) -> bool {
        self.state.lock().evictable() && self.turn_gate.try_lock().is_ok()
    }

    /// Check and mark under one state lock, so a writer either lands
    /// before (and blocks eviction) or sees `evicted` and retries
    fn mark_evicted(&self) -> bool {
        let mut state = self.state.lock();
        if !state.evictable() || self.turn_gate.try_lock().is_err() {
            return false;
        }
        state.evicted = true;
        true
    }
}

/// Conversation counts by phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub conversations: usize,
    pub idle: usize,
    pub buffering: usize,
    pub flushing: usize,
}

/// Registry of per-conversation buffers
///
/// Must be used from within a tokio runtime: debounce timers are tasks.
pub struct TurnBuffer {
    slots: DashMap<ConversationId, Arc<Slot>>,
    config: BufferConfig,
    flush_tx: mpsc::UnboundedSender<FlushRequest>,
    events: EventBus,
}

impl TurnBuffer {
    pub fn new(config: BufferConfig, events: EventBus) -> (Self, mpsc::UnboundedReceiver<FlushRequest>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let buffer = Self {
            slots: DashMap::new(),
            config,
            flush_tx,
            events,
        };
        (buffer, flush_rx)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    fn slot(&self, id: &ConversationId) -> Option<Arc<Slot>> {
        self.slots.get(id).map(|s| s.value().clone())
    }

    fn slot_or_create(&self, id: &ConversationId) -> Arc<Slot> {
        if let Some(slot) = self.slot(id) {
            return slot;
        }
        if self.slots.len() >= self.config.max_conversations {
            self.evict_least_recent(self.slots.len() + 1 - self.config.max_conversations);
        }
        self.slots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .value()
            .clone()
    }

    /// Queue a fragment and decide what happens next
    ///
    /// Any pending debounce timer is cancelled first. A thought-ending fragment
    /// requests a flush immediately; anything else re-arms the timer.
    pub fn enqueue(&self, id: &ConversationId, fragment: &str, meta: FragmentMeta) -> FlushDecision {
        let text = fragment.trim();
        if text.is_empty() {
            trace!(conversation_id = %id, "Ignoring empty fragment");
            return FlushDecision::Ignored;
        }

        loop {
            let slot = self.slot_or_create(id);
            let mut state = slot.state.lock();
            if state.evicted {
                // Lost a race with the sweeper
                continue;
            }

            state.cancel_timer();
            state.fragments.push(text.to_string());
            state.audio_seconds = state.audio_seconds.saturating_add(meta.audio_seconds);
            if meta.timezone.is_some() {
                state.timezone = meta.timezone.clone();
            }
            if meta.binding.is_some() {
                state.binding = meta.binding.clone();
            }
            state.last_activity = Instant::now();
            if state.phase == Phase::Idle {
                state.phase = Phase::Buffering;
            }

            if ends_thought(text) {
                debug!(conversation_id = %id, pending = state.fragments.len(), "End of thought, flushing");
                drop(state);
                self.request_flush(id, FlushReason::EndOfThought);
                return FlushDecision::FlushedImmediately;
            }

            let generation = state.generation;
            state.timer = Some(self.spawn_timer(id.clone(), Arc::downgrade(&slot), generation));
            debug!(
                conversation_id = %id,
                pending = state.fragments.len(),
                debounce_ms = self.config.debounce_ms,
                "Fragment queued, debounce armed"
            );
            drop(state);
            self.events.publish(TurnEvent::FlushScheduled(id.clone()));
            return FlushDecision::Scheduled;
        }
    }

    fn spawn_timer(&self, id: ConversationId, slot: Weak<Slot>, generation: u64) -> JoinHandle<()> {
        let delay = self.config.debounce();
        let tx = self.flush_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(slot) = slot.upgrade() else {
                return;
            };
            {
                let mut state = slot.state.lock();
                if state.generation != generation {
                    trace!(conversation_id = %id, "Superseded timer woke up, ignoring");
                    return;
                }
                state.timer = None;
            }
            let _ = tx.send(FlushRequest {
                conversation_id: id,
                reason: FlushReason::Debounce,
            });
        })
    }

    /// Ask for a flush now (client `final`, disconnect)
    pub fn request_flush(&self, id: &ConversationId, reason: FlushReason) {
        // Receiver gone means shutdown; pending work is abandoned
        let _ = self.flush_tx.send(FlushRequest {
            conversation_id: id.clone(),
            reason,
        });
    }

    /// Gate serializing turns for `id`, if the conversation is known
    pub fn turn_gate(&self, id: &ConversationId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.slot(id).map(|slot| slot.turn_gate.clone())
    }

    /// Drain everything pending for `id`
    ///
    /// Returns `None` (and changes nothing) when there is nothing pending.
    /// Otherwise cancels the timer and moves the slot to `Flushing`; the caller
    /// must follow up with [`TurnBuffer::finish_flush`].
    pub fn flush(&self, id: &ConversationId) -> Option<JoinedMessage> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock();
        if state.fragments.is_empty() {
            trace!(conversation_id = %id, "Flush on empty buffer");
            return None;
        }

        state.cancel_timer();
        let fragments = std::mem::take(&mut state.fragments);
        let audio_seconds = std::mem::take(&mut state.audio_seconds);
        state.phase = Phase::Flushing;
        state.last_activity = Instant::now();

        debug!(conversation_id = %id, fragments = fragments.len(), "Buffer drained");
        Some(JoinedMessage {
            conversation_id: id.clone(),
            text: fragments.join(" "),
            fragment_count: fragments.len(),
            audio_seconds,
            timezone: state.timezone.clone(),
            binding: state.binding.clone(),
        })
    }

    /// Client-requested flush; same semantics as [`TurnBuffer::flush`]
    pub fn final_flush(&self, id: &ConversationId) -> Option<JoinedMessage> {
        debug!(conversation_id = %id, "Final flush");
        self.flush(id)
    }

    /// Turn done: back to `Idle`, or `Buffering` if fragments arrived meanwhile
    pub fn finish_flush(&self, id: &ConversationId) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let mut state = slot.state.lock();
        if state.phase != Phase::Flushing {
            return;
        }
        state.phase = if state.fragments.is_empty() {
            Phase::Idle
        } else {
            Phase::Buffering
        };
        state.last_activity = Instant::now();
    }

    /// Attach or replace metadata without queuing a fragment
    pub fn bind(&self, id: &ConversationId, meta: FragmentMeta) {
        loop {
            let slot = self.slot_or_create(id);
            let mut state = slot.state.lock();
            if state.evicted {
                continue;
            }
            if meta.timezone.is_some() {
                state.timezone = meta.timezone;
            }
            if meta.binding.is_some() {
                state.binding = meta.binding;
            }
            state.last_activity = Instant::now();
            return;
        }
    }

    pub fn phase(&self, id: &ConversationId) -> Option<Phase> {
        self.slot(id).map(|slot| slot.state.lock().phase)
    }

    pub fn pending(&self, id: &ConversationId) -> usize {
        self.slot(id).map_or(0, |slot| slot.state.lock().fragments.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        let mut stats = BufferStats::default();
        for entry in self.slots.iter() {
            stats.conversations += 1;
            match entry.value().state.lock().phase {
                Phase::Idle => stats.idle += 1,
                Phase::Buffering => stats.buffering += 1,
                Phase::Flushing => stats.flushing += 1,
            }
        }
        stats
    }

    /// Remove one slot if it is still idle; true when removed
    fn try_evict(&self, id: &ConversationId) -> bool {
        let removed = self
            .slots
            .remove_if(id, |_, slot| slot.mark_evicted())
            .is_some();

        if removed {
            debug!(conversation_id = %id, "Conversation evicted");
            self.events.publish(TurnEvent::ConversationEvicted(id.clone()));
        }
        removed
    }

    fn evict_least_recent(&self, count: usize) -> usize {
        let mut idle: Vec<(Instant, ConversationId)> = self
            .slots
            .iter()
            .filter(|e| e.value().idle_and_unlocked())
            .map(|e| (e.value().state.lock().last_activity, e.key().clone()))
            .collect();
        idle.sort();

        idle.into_iter()
            .filter(|(_, id)| self.try_evict(id))
            .take(count)
            .count()
    }

    /// Evict idle conversations past their TTL; returns how many went
    pub fn sweep(&self) -> usize {
        let ttl = self.config.idle_ttl();
        let expired: Vec<ConversationId> = self
            .slots
            .iter()
            .filter(|e| e.value().state.lock().last_activity.elapsed() >= ttl)
            .map(|e| e.key().clone())
            .collect();

        let evicted = expired.iter().filter(|id| self.try_evict(id)).count();
        if evicted > 0 {
            debug!(evicted, remaining = self.slots.len(), "Buffer sweep");
        }
        evicted
    }

    /// Abandon every pending timer (shutdown)
    pub fn cancel_all(&self) {
        for entry in self.slots.iter() {
            entry.value().state.lock().cancel_timer();
        }
    }
}
