//! Relationship scorer
//!
//! Owns every mutation of relationship state: headline score with cooldown
//! hysteresis, dimension steps from relations tags, stage progression from
//! signals tags, idle decay and the re-engagement bookkeeping. Writes go through [`RelationshipStore`] with an
//! optimistic version check and are retried on conflict.

pub mod decay;
pub mod reengage;
pub mod score;
pub mod stage;
pub mod tags;

pub use decay::{apply_inactivity_decay, decay_for, idle_days, DecayCurve, DecayRules};
pub use reengage::{ReengagementCandidate, ReengagementRule};
pub use score::{move_dimensions, update_score, CooldownPolicy, FixedPenalty, HalfDropPenalty, ScoreRules};
pub use stage::Signals;
pub use tags::{extract_dimensions, extract_score, extract_signals, find_score, strip_tags, DimensionTargets};

use crate::clock::Clock;
use crate::config::ScorerConfig;
use crate::error::{LedgerError, StoreError};
use crate::ledger::CreditLedger;
use crate::store::RelationshipStore;
use cadence_types::{Dimensions, Mode, RelationshipSnapshot, RelationshipStage, WalletKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// (subject, counterparty) pair a relationship belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub subject_id: String,
    pub counterparty_id: String,
}

impl RelationshipKey {
    pub fn new(subject_id: impl Into<String>, counterparty_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            counterparty_id: counterparty_id.into(),
        }
    }
}

fn zero_dimensions() -> Dimensions {
    Dimensions::ZERO
}

/// Persisted relationship state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipState {
    /// Headline score in `[0, 100]`
    pub score: f64,
    pub cooldown: u32,
    pub dimensions: Dimensions,
    #[serde(default)]
    pub stage: RelationshipStage,
    /// Drives the positive stages, `[0, 100]`
    #[serde(default)]
    pub stage_points: f64,
    /// `[-100, 100]`
    #[serde(default)]
    pub sentiment: f64,
    pub last_interaction_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reengaged_at: Option<DateTime<Utc>>,
    /// Decay already taken during the current idle episode
    #[serde(default = "zero_dimensions")]
    pub idle_decay_applied: Dimensions,
    /// Optimistic concurrency token; 0 until first stored
    #[serde(default)]
    pub version: u64,
}

impl RelationshipState {
    pub fn new(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            cooldown: 0,
            dimensions: Dimensions::default(),
            stage: RelationshipStage::default(),
            stage_points: 0.0,
            sentiment: 0.0,
            last_interaction_at: None,
            last_reengaged_at: None,
            idle_decay_applied: Dimensions::ZERO,
            version: 0,
        }
    }

    /// A nudge already went out after the last real interaction
    pub fn notified_since_last_interaction(&self) -> bool {
        match (self.last_reengaged_at, self.last_interaction_at) {
            (Some(nudged), Some(seen)) => nudged > seen,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn snapshot(&self) -> RelationshipSnapshot {
        RelationshipSnapshot {
            score: self.score,
            cooldown: self.cooldown,
            dimensions: self.dimensions,
            stage: self.stage,
            stage_points: self.stage_points,
            sentiment: self.sentiment,
            last_interaction_at: self.last_interaction_at,
        }
    }
}

/// Relationship scorer over a versioned store
pub struct RelationshipScorer {
    store: Arc<dyn RelationshipStore>,
    clock: Arc<dyn Clock>,
    rules: ScoreRules,
    decay: DecayRules,
    reengagement: ReengagementRule,
    default_score: f64,
    save_retries: u32,
}

impl RelationshipScorer {
    pub fn new(store: Arc<dyn RelationshipStore>, clock: Arc<dyn Clock>, config: &ScorerConfig) -> Self {
        Self {
            store,
            clock,
            rules: ScoreRules::from_config(config),
            decay: config.decay,
            reengagement: ReengagementRule::from_config(config),
            default_score: config.default_score,
            save_retries: 3,
        }
    }

    pub fn with_cooldown_policy(mut self, policy: Arc<dyn CooldownPolicy>) -> Self {
        self.rules.policy = policy;
        self
    }

    pub fn with_save_retries(mut self, retries: u32) -> Self {
        self.save_retries = retries;
        self
    }

    pub fn rules(&self) -> &ScoreRules {
        &self.rules
    }

    /// Stored state, or a fresh one at the default score
    pub fn load(&self, key: &RelationshipKey) -> Result<RelationshipState, StoreError> {
        Ok(self
            .store
            .get_relationship_score(key)?
            .unwrap_or_else(|| RelationshipState::new(self.default_score)))
    }

    /// Current state with any owed decay applied (not persisted)
    pub fn snapshot(&self, key: &RelationshipKey) -> Result<RelationshipSnapshot, StoreError> {
        let mut state = self.load(key)?;
        self.decay.apply(&mut state, self.clock.now());
        Ok(state.snapshot())
    }

    /// Load, mutate, save; retried when another writer bumped the version
    fn modify<T>(
        &self,
        key: &RelationshipKey,
        mut change: impl FnMut(&mut RelationshipState) -> T,
    ) -> Result<(RelationshipState, T), StoreError> {
        let mut attempt = 0;
        loop {
            let mut state = self.load(key)?;
            let out = change(&mut state);
            match self.store.save_relationship_score(key, &state) {
                Ok(version) => {
                    state.version = version;
                    return Ok((state, out));
                }
                Err(StoreError::VersionConflict { expected, found }) if attempt < self.save_retries => {
                    attempt += 1;
                    debug!(
                        subject = %key.subject_id,
                        counterparty = %key.counterparty_id,
                        expected,
                        found,
                        attempt,
                        "Relationship version conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply one completed turn's reply to the relationship
    ///
    /// Owed idle decay lands first, then the score tag (if any) moves the
    /// headline score and the relations tag (if any) moves dimensions. The
    /// signals tag (absent means a calm turn) advances the stage. The turn
    /// counts as an interaction either way.
    pub fn apply_turn(&self, key: &RelationshipKey, reply: &str) -> Result<RelationshipSnapshot, StoreError> {
        let proposed_tag = tags::find_score(reply);
        let targets = tags::extract_dimensions(reply);
        let signals = tags::extract_signals(reply);
        let now = self.clock.now();

        let (state, (before, idle)) = self.modify(key, |state| {
            let idle = self.decay.apply(state, now);
            let before = state.score;

            // No tag proposes the current score: a no-op
            let proposed = proposed_tag.unwrap_or(state.score);
            let (score, cooldown) = self.rules.update(state.score, proposed, state.cooldown);
            state.score = score;
            state.cooldown = cooldown;

            if !targets.is_empty() {
                state.dimensions = move_dimensions(state.dimensions, &targets);
            }
            (state.stage_points, state.sentiment, state.stage) =
                stage::advance(state.stage_points, state.sentiment, &signals);
            decay::record_interaction(state, now);
            (before, idle)
        })?;

        debug!(
            subject = %key.subject_id,
            counterparty = %key.counterparty_id,
            before,
            after = state.score,
            cooldown = state.cooldown,
            stage = state.stage.as_str(),
            stage_points = state.stage_points,
            idle_days = idle,
            "Relationship updated"
        );
        Ok(state.snapshot())
    }

    /// Persist owed decay without counting an interaction
    pub fn refresh_decay(&self, key: &RelationshipKey) -> Result<(RelationshipState, f64), StoreError> {
        let now = self.clock.now();
        self.modify(key, |state| self.decay.apply(state, now))
    }

    /// Relationships that should receive a re-engagement nudge now
    ///
    /// Balance is the larger of the standard and adult wallets for the pair.
    pub fn find_reengagement_candidates(
        &self,
        ledger: &CreditLedger,
    ) -> Result<Vec<ReengagementCandidate>, LedgerError> {
        let now = self.clock.now();
        let mut candidates = Vec::new();

        for (key, mut state) in self.store.list_relationships()? {
            let idle = self.decay.apply(&mut state, now);
            if idle <= self.reengagement.idle_days {
                continue;
            }

            let mut balance = 0;
            for mode in [Mode::Standard, Mode::Adult] {
                let wallet = WalletKey::new(key.subject_id.clone(), key.counterparty_id.clone(), mode);
                balance = balance.max(ledger.balance(&wallet)?);
            }

            if self.reengagement.should_trigger_reengagement(
                idle,
                balance,
                state.notified_since_last_interaction(),
            ) {
                candidates.push(ReengagementCandidate {
                    key,
                    idle_days: idle,
                    balance_cents: balance,
                    score: state.score,
                });
            }
        }

        info!(count = candidates.len(), "Re-engagement scan complete");
        Ok(candidates)
    }

    /// Record that a nudge went out, closing this idle episode for nudges
    pub fn mark_reengaged(&self, key: &RelationshipKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        match self.modify(key, |state| state.last_reengaged_at = Some(at)) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    subject = %key.subject_id,
                    counterparty = %key.counterparty_id,
                    error = %e,
                    "Failed to mark re-engagement"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn scorer(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> RelationshipScorer {
        RelationshipScorer::new(store, clock, &ScorerConfig::default())
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_apply_turn_moves_score_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let scorer = scorer(store.clone(), clock);
        let key = RelationshipKey::new("u-1", "cp-1");

        let snap = scorer.apply_turn(&key, "hi! [Lollity Score: 80/100]").unwrap();
        assert_eq!(snap.score, 50.5);
        assert_eq!(snap.last_interaction_at, Some(start()));

        let stored = store.get_relationship_score(&key).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.score, 50.5);
    }

    #[test]
    fn test_missing_tag_keeps_score() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let scorer = scorer(store, clock);
        let key = RelationshipKey::new("u-1", "cp-1");

        scorer.apply_turn(&key, "[Score: 30/100]").unwrap();
        let snap = scorer.apply_turn(&key, "no tag at all").unwrap();
        assert_eq!(snap.score, 30.0);
        assert_eq!(snap.cooldown, 5);
    }

    #[test]
    fn test_relations_tag_moves_dimensions() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let scorer = scorer(store, clock);
        let key = RelationshipKey::new("u-1", "cp-1");

        let snap = scorer.apply_turn(&key, "[Relations: Trust=90]").unwrap();
        assert!(snap.dimensions.trust > 10.0 && snap.dimensions.trust <= 12.0);
        assert_eq!(snap.dimensions.safety, 95.0);
    }

    #[test]
    fn test_idle_decay_applies_before_turn() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let scorer = scorer(store, clock.clone());
        let key = RelationshipKey::new("u-1", "cp-1");

        scorer.apply_turn(&key, "hello").unwrap();
        clock.advance(Duration::days(4));

        let snap = scorer.snapshot(&key).unwrap();
        // closeness 10 - 6, attraction 5 - 7.2 floored at 0
        assert_eq!(snap.dimensions.closeness, 4.0);
        assert_eq!(snap.dimensions.attraction, 0.0);

        let snap = scorer.apply_turn(&key, "back again").unwrap();
        assert_eq!(snap.dimensions.closeness, 4.0);
        assert_eq!(snap.last_interaction_at, Some(clock.now()));
    }

    #[test]
    fn test_notified_since_last_interaction() {
        let mut state = RelationshipState::new(50.0);
        assert!(!state.notified_since_last_interaction());

        state.last_interaction_at = Some(start());
        state.last_reengaged_at = Some(start() + Duration::days(4));
        assert!(state.notified_since_last_interaction());

        state.last_interaction_at = Some(start() + Duration::days(5));
        assert!(!state.notified_since_last_interaction());
    }

    #[test]
    fn test_signals_drive_stage() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let scorer = scorer(store.clone(), clock);
        let key = RelationshipKey::new("u-1", "cp-1");

        let snap = scorer.apply_turn(&key, "hello").unwrap();
        assert_eq!(snap.stage, RelationshipStage::Strangers);
        assert_eq!(snap.stage_points, 0.25);

        // 3 points per warm turn: 0.25 + 7 * 3 crosses 20
        for _ in 0..7 {
            scorer
                .apply_turn(&key, "love it [Signals: support=1, affection=1, respect=1]")
                .unwrap();
        }
        let snap = scorer.snapshot(&key).unwrap();
        assert_eq!(snap.stage, RelationshipStage::Talking);
        assert_eq!(snap.stage_points, 21.25);
        assert_eq!(snap.sentiment, 35.0);

        let snap = scorer.apply_turn(&key, "[Signals: threat=0.5]").unwrap();
        assert_eq!(snap.stage, RelationshipStage::Hate);
        assert_eq!(snap.stage_points, 16.25);

        // Next calm turn falls back to the points-based stage
        let snap = scorer.apply_turn(&key, "sorry").unwrap();
        assert_eq!(snap.stage, RelationshipStage::Strangers);
        assert_eq!(store.get_relationship_score(&key).unwrap().unwrap().stage, RelationshipStage::Strangers);
    }
}
