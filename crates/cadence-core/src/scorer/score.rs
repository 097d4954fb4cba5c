//! Headline score movement with cooldown hysteresis, and dimension steps

use crate::config::ScorerConfig;
use cadence_types::Dimensions;
use std::fmt;
use std::sync::Arc;

use super::tags::DimensionTargets;

/// Cooldown added when the score drops by `drop` points
pub trait CooldownPolicy: Send + Sync + fmt::Debug {
    fn penalty(&self, drop: f64) -> u32;
}

/// `max(1, floor(drop / 2))` for drops of 2 points or more, otherwise 1
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfDropPenalty;

impl CooldownPolicy for HalfDropPenalty {
    fn penalty(&self, drop: f64) -> u32 {
        if drop >= 2.0 {
            ((drop / 2.0).floor() as u32).max(1)
        } else {
            1
        }
    }
}

/// Flat penalty regardless of drop size
#[derive(Debug, Clone, Copy)]
pub struct FixedPenalty(pub u32);

impl CooldownPolicy for FixedPenalty {
    fn penalty(&self, _drop: f64) -> u32 {
        self.0
    }
}

/// Parameters of [`ScoreRules::update`]
#[derive(Debug, Clone)]
pub struct ScoreRules {
    pub max_up_step: f64,
    pub cooldown_up_step: f64,
    pub max_cooldown: u32,
    pub policy: Arc<dyn CooldownPolicy>,
}

impl Default for ScoreRules {
    fn default() -> Self {
        Self::from_config(&ScorerConfig::default())
    }
}

impl ScoreRules {
    pub fn from_config(config: &ScorerConfig) -> Self {
        Self {
            max_up_step: config.max_up_step,
            cooldown_up_step: config.cooldown_up_step,
            max_cooldown: config.max_cooldown,
            policy: Arc::new(HalfDropPenalty),
        }
    }

    /// Move `current` toward `proposed`, returning `(new_score, new_cooldown)`
    ///
    /// Rises are capped per turn (tighter while cooldown is active), drops land
    /// in full and arm the cooldown. The result is always within `[0, 100]`.
    pub fn update(&self, current: f64, proposed: f64, cooldown: u32) -> (f64, u32) {
        let current = if current.is_finite() { current.clamp(0.0, 100.0) } else { 0.0 };
        if !proposed.is_finite() {
            return (current, cooldown);
        }
        let bounded = proposed.clamp(0.0, 100.0);

        if bounded > current {
            let step = if cooldown > 0 {
                self.cooldown_up_step
            } else {
                self.max_up_step
            };
            let next = (current + step).min(bounded);
            let cooldown = if next > current && cooldown > 0 {
                cooldown - 1
            } else {
                cooldown
            };
            (next, cooldown)
        } else if bounded < current {
            let penalty = self.policy.penalty(current - bounded);
            let cooldown = cooldown.saturating_add(penalty).min(self.max_cooldown);
            (bounded, cooldown)
        } else {
            (current, cooldown)
        }
    }
}

/// [`ScoreRules::update`] with the default rules
pub fn update_score(current: f64, proposed: f64, cooldown: u32) -> (f64, u32) {
    ScoreRules::default().update(current, proposed, cooldown)
}

const SAT_UP_K: f64 = 0.015;
const SAT_DOWN_K: f64 = 0.03;
const DIMENSION_UP_CAP: f64 = 2.0;
const DIMENSION_DOWN_CAP: f64 = 3.5;

/// Saturating rise: large gaps close quickly, values near 100 barely move
pub fn sat_up(x: f64, delta: f64) -> f64 {
    if delta <= 0.0 {
        return x;
    }
    x + (100.0 - x) * (1.0 - (-SAT_UP_K * delta).exp())
}

pub fn sat_down(x: f64, delta: f64) -> f64 {
    if delta <= 0.0 {
        return x;
    }
    x - x * (1.0 - (-SAT_DOWN_K * delta).exp())
}

fn step_toward(x: f64, target: f64) -> f64 {
    let target = target.clamp(0.0, 100.0);
    if target > x {
        sat_up(x, target - x).min(x + DIMENSION_UP_CAP).min(target)
    } else if target < x {
        sat_down(x, x - target).max(x - DIMENSION_DOWN_CAP).max(target)
    } else {
        x
    }
}

/// Move each tagged dimension one bounded step toward its target
pub fn move_dimensions(current: Dimensions, targets: &DimensionTargets) -> Dimensions {
    let step = |x: f64, target: Option<f64>| target.map_or(x, |t| step_toward(x, t));
    Dimensions {
        trust: step(current.trust, targets.trust),
        closeness: step(current.closeness, targets.closeness),
        attraction: step(current.attraction, targets.attraction),
        safety: step(current.safety, targets.safety),
    }
    .clamped()
}
