//! Time-based cooling of relationship dimensions
//!
//! Total decay is a function of idle days only, so applying it repeatedly
//! within one idle episode just tops up the difference from the last call.

use super::RelationshipState;
use cadence_types::Dimensions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Decay owed by one dimension: `min(cap, per_day · (d − offset_days))` once `d ≥ start_days`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayCurve {
    pub start_days: f64,
    pub per_day: f64,
    #[serde(default)]
    pub offset_days: f64,
    pub cap: f64,
}

impl DecayCurve {
    pub fn owed(&self, idle_days: f64) -> f64 {
        if idle_days < self.start_days {
            return 0.0;
        }
        (self.per_day * (idle_days - self.offset_days)).clamp(0.0, self.cap)
    }
}

/// Per-dimension decay curves; `None` never decays
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayRules {
    pub trust: Option<DecayCurve>,
    pub closeness: Option<DecayCurve>,
    pub attraction: Option<DecayCurve>,
    pub safety: Option<DecayCurve>,
}

impl Default for DecayRules {
    /// - closeness: `min(8, 1.5·d)` from 2 days
    /// - attraction: `min(10, 1.8·d)` from 3 days
    /// - trust: `min(5, 0.8·(d − 6))` from 7 days
    /// - safety: never
    fn default() -> Self {
        Self {
            closeness: Some(DecayCurve {
                start_days: 2.0,
                per_day: 1.5,
                offset_days: 0.0,
                cap: 8.0,
            }),
            attraction: Some(DecayCurve {
                start_days: 3.0,
                per_day: 1.8,
                offset_days: 0.0,
                cap: 10.0,
            }),
            trust: Some(DecayCurve {
                start_days: 7.0,
                per_day: 0.8,
                offset_days: 6.0,
                cap: 5.0,
            }),
            safety: None,
        }
    }
}

impl DecayRules {
    /// Total decay owed after `idle_days` without interaction
    pub fn owed(&self, idle_days: f64) -> Dimensions {
        let d = idle_days.max(0.0);
        let owed = |curve: Option<DecayCurve>| curve.map_or(0.0, |c| c.owed(d));
        Dimensions {
            trust: owed(self.trust),
            closeness: owed(self.closeness),
            attraction: owed(self.attraction),
            safety: owed(self.safety),
        }
    }

    /// Apply whatever decay is still owed for the current idle episode
    ///
    /// Returns the idle-day count so callers can reuse it for re-engagement gating.
    pub fn apply(&self, state: &mut RelationshipState, now: DateTime<Utc>) -> f64 {
        let days = idle_days(state, now);
        let owed = self.owed(days);
        let applied = state.idle_decay_applied;

        let delta = |owed: f64, applied: f64| (owed - applied).max(0.0);
        state.dimensions = Dimensions {
            trust: state.dimensions.trust - delta(owed.trust, applied.trust),
            closeness: state.dimensions.closeness - delta(owed.closeness, applied.closeness),
            attraction: state.dimensions.attraction - delta(owed.attraction, applied.attraction),
            safety: state.dimensions.safety - delta(owed.safety, applied.safety),
        }
        .clamped();

        state.idle_decay_applied = Dimensions {
            trust: owed.trust.max(applied.trust),
            closeness: owed.closeness.max(applied.closeness),
            attraction: owed.attraction.max(applied.attraction),
            safety: owed.safety.max(applied.safety),
        };
        days
    }
}

/// Decay owed under the default curves
pub fn decay_for(idle_days: f64) -> Dimensions {
    DecayRules::default().owed(idle_days)
}

/// Days since the last interaction (0 for a relationship that never had one)
pub fn idle_days(state: &RelationshipState, now: DateTime<Utc>) -> f64 {
    state
        .last_interaction_at
        .map(|last| ((now - last).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY).max(0.0))
        .unwrap_or(0.0)
}

/// [`DecayRules::apply`] with the default curves
pub fn apply_inactivity_decay(state: &mut RelationshipState, now: DateTime<Utc>) -> f64 {
    DecayRules::default().apply(state, now)
}

/// A real interaction: idle baseline back to zero
pub fn record_interaction(state: &mut RelationshipState, now: DateTime<Utc>) {
    state.last_interaction_at = Some(now);
    state.idle_decay_applied = Dimensions::ZERO;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn state_idle_since(last: DateTime<Utc>) -> RelationshipState {
        let mut state = RelationshipState::new(50.0);
        state.dimensions = Dimensions {
            trust: 60.0,
            closeness: 60.0,
            attraction: 60.0,
            safety: 90.0,
        };
        state.last_interaction_at = Some(last);
        state
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(decay_for(1.9), Dimensions::ZERO);
        let two = decay_for(2.0);
        assert_eq!(two.closeness, 3.0);
        assert_eq!(two.attraction, 0.0);

        let ten = decay_for(10.0);
        assert_eq!(ten.closeness, 8.0);
        assert_eq!(ten.attraction, 10.0);
        assert!((ten.trust - 3.2).abs() < 1e-9);
        assert_eq!(ten.safety, 0.0);
    }

    #[test]
    fn test_decay_monotonic_in_idle_days() {
        let mut prev = decay_for(0.0);
        for tenth in 1..400 {
            let next = decay_for(tenth as f64 / 10.0);
            assert!(next.trust >= prev.trust);
            assert!(next.closeness >= prev.closeness);
            assert!(next.attraction >= prev.attraction);
            assert_eq!(next.safety, 0.0);
            prev = next;
        }
    }

    #[test]
    fn test_repeated_application_is_incremental() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut state = state_idle_since(start);

        let days = apply_inactivity_decay(&mut state, start + Duration::days(4));
        assert_eq!(days, 4.0);
        assert_eq!(state.dimensions.closeness, 54.0);

        // Same moment again: nothing more owed
        apply_inactivity_decay(&mut state, start + Duration::days(4));
        assert_eq!(state.dimensions.closeness, 54.0);

        // Total owed is capped at 8, so only 2 more
        apply_inactivity_decay(&mut state, start + Duration::days(6));
        assert_eq!(state.dimensions.closeness, 52.0);
        assert_eq!(state.dimensions.safety, 90.0);
    }

    #[test]
    fn test_dimensions_never_increase_while_idle() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut state = state_idle_since(start);
        let mut prev = state.dimensions;
        for hour in (0..24 * 30).step_by(7) {
            apply_inactivity_decay(&mut state, start + Duration::hours(hour));
            assert!(state.dimensions.trust <= prev.trust);
            assert!(state.dimensions.closeness <= prev.closeness);
            assert!(state.dimensions.attraction <= prev.attraction);
            assert!(state.dimensions.trust >= 0.0);
            prev = state.dimensions;
        }
    }

    #[test]
    fn test_interaction_resets_baseline() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut state = state_idle_since(start);
        apply_inactivity_decay(&mut state, start + Duration::days(5));

        let back = start + Duration::days(5);
        record_interaction(&mut state, back);
        assert_eq!(idle_days(&state, back), 0.0);
        assert_eq!(state.idle_decay_applied, Dimensions::ZERO);

        let before = state.dimensions;
        apply_inactivity_decay(&mut state, back + Duration::hours(12));
        assert_eq!(state.dimensions, before);
    }

    #[test]
    fn test_custom_rules() {
        let rules = DecayRules {
            safety: Some(DecayCurve {
                start_days: 1.0,
                per_day: 2.0,
                offset_days: 0.0,
                cap: 3.0,
            }),
            closeness: None,
            ..DecayRules::default()
        };
        let owed = rules.owed(5.0);
        assert_eq!(owed.safety, 3.0);
        assert_eq!(owed.closeness, 0.0);
        assert_eq!(owed.attraction, 9.0);
    }

    #[test]
    fn test_never_interacted_has_no_idle_time() {
        let mut state = RelationshipState::new(50.0);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(apply_inactivity_decay(&mut state, now), 0.0);
        assert_eq!(state.dimensions, Dimensions::default());
    }
}
