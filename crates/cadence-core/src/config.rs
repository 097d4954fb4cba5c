//! Runtime configuration
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! no file at all) is valid.
//!
//! ```toml
//! [buffer]
//! debounce_ms = 2500
//!
//! [pricing.text]
//! unit = "message"
//! price_cents = 5
//! free_allowance = 100
//! ```

use crate::error::ConfigError;
use crate::ledger::PriceTable;
use crate::scorer::{DecayCurve, DecayRules};
use cadence_types::PriceRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub buffer: BufferConfig,
    pub scorer: ScorerConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,

    /// Price rules keyed by feature identifier (`text`, `voice_18`, ...)
    ///
    /// Features left out fall back to the built-in defaults.
    pub pricing: BTreeMap<String, PriceRule>,
}

/// Turn buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Debounce window after the last fragment
    pub debounce_ms: u64,

    /// Upper bound on tracked conversations
    pub max_conversations: usize,

    /// Idle conversations older than this are evicted
    pub idle_ttl_secs: u64,

    /// How often the eviction sweep runs
    pub sweep_interval_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_500,
            max_conversations: 10_000,
            idle_ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl BufferConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Relationship scorer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Largest upward move per turn
    pub max_up_step: f64,

    /// Upward move per turn while cooldown is active
    pub cooldown_up_step: f64,

    /// Cooldown ceiling
    pub max_cooldown: u32,

    /// Score of a relationship with no history
    pub default_score: f64,

    /// Idle decay curves per dimension (`[scorer.decay.closeness]`, ...)
    pub decay: DecayRules,

    /// Idle days before a re-engagement nudge may fire
    pub reengage_idle_days: f64,

    /// Minimum wallet balance for a re-engagement nudge
    pub reengage_min_balance_cents: i64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            max_up_step: 0.5,
            cooldown_up_step: 0.25,
            max_cooldown: 5,
            default_score: 50.0,
            decay: DecayRules::default(),
            reengage_idle_days: 3.0,
            reengage_min_balance_cents: 50_00,
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bound on a single turn-executor call
    pub executor_timeout_secs: u64,

    /// Attempts to save a score when another writer got there first
    pub score_save_retries: u32,

    /// Units billed per text turn
    pub text_units_per_turn: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executor_timeout_secs: 60,
            score_save_retries: 3,
            text_units_per_turn: 1,
        }
    }
}

impl OrchestratorConfig {
    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file (default: `<data dir>/cadence/cadence.db`)
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cadence")
                .join("cadence.db")
        })
    }
}

impl CadenceConfig {
    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            debug!("No config file given, using defaults");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;

        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scorer.cooldown_up_step > self.scorer.max_up_step {
            return Err(ConfigError::Invalid {
                message: format!(
                    "scorer.cooldown_up_step ({}) exceeds scorer.max_up_step ({})",
                    self.scorer.cooldown_up_step, self.scorer.max_up_step
                ),
            });
        }
        if self.scorer.max_up_step <= 0.0 || self.scorer.cooldown_up_step < 0.0 {
            return Err(ConfigError::Invalid {
                message: "scorer steps must be positive".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&self.scorer.default_score) {
            return Err(ConfigError::Invalid {
                message: format!("scorer.default_score {} outside [0, 100]", self.scorer.default_score),
            });
        }
        let decay = &self.scorer.decay;
        let curves: [Option<DecayCurve>; 4] = [decay.trust, decay.closeness, decay.attraction, decay.safety];
        if curves.iter().flatten().any(|c| c.per_day < 0.0 || c.cap < 0.0) {
            return Err(ConfigError::Invalid {
                message: "scorer.decay curves must not be negative".to_string(),
            });
        }
        for (feature, rule) in &self.pricing {
            if rule.price_cents < 0 {
                return Err(ConfigError::Invalid {
                    message: format!("pricing.{} has a negative price", feature),
                });
            }
        }
        // Fails loudly on unknown feature identifiers
        self.price_table()?;
        Ok(())
    }

    /// Built-in price table overlaid with the configured rules
    pub fn price_table(&self) -> Result<PriceTable, ConfigError> {
        let mut table = PriceTable::defaults();
        for (id, rule) in &self.pricing {
            table.set(id.parse()?, *rule);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{Feature, Mode, Unit};

    #[test]
    fn test_defaults() {
        let config = CadenceConfig::default();
        assert_eq!(config.buffer.debounce(), Duration::from_millis(2_500));
        assert_eq!(config.scorer.max_cooldown, 5);
        assert_eq!(config.orchestrator.text_units_per_turn, 1);
    }

    #[test]
    fn test_partial_toml() {
        let config = CadenceConfig::from_toml(
            r#"
            [buffer]
            debounce_ms = 800

            [pricing.text_18]
            unit = "message"
            price_cents = 9
            free_allowance = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.debounce_ms, 800);
        assert_eq!(config.buffer.max_conversations, 10_000);

        let table = config.price_table().unwrap();
        let adult = table.rule(Feature::text(Mode::Adult)).unwrap();
        assert_eq!(adult.price_cents, 9);
        assert_eq!(adult.unit, Unit::Message);
        // Untouched features keep defaults
        assert_eq!(table.rule(Feature::text(Mode::Standard)).unwrap().price_cents, 5);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let err = CadenceConfig::from_toml(
            r#"
            [pricing.video]
            unit = "second"
            price_cents = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFeature(_)));
    }

    #[test]
    fn test_inverted_steps_rejected() {
        let err = CadenceConfig::from_toml(
            r#"
            [scorer]
            max_up_step = 0.2
            cooldown_up_step = 0.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_decay_curve_override() {
        let config = CadenceConfig::from_toml(
            r#"
            [scorer.decay.safety]
            start_days = 14
            per_day = 0.5
            cap = 4
            "#,
        )
        .unwrap();
        let decay = config.scorer.decay;
        assert_eq!(decay.safety.unwrap().cap, 4.0);
        // Untouched dimensions keep their defaults
        assert_eq!(decay.closeness.unwrap().start_days, 2.0);

        let err = CadenceConfig::from_toml(
            r#"
            [scorer.decay.trust]
            start_days = 1
            per_day = -1
            cap = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CadenceConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_without_path_is_default() {
        let config = CadenceConfig::load(None).unwrap();
        assert_eq!(config.buffer.idle_ttl_secs, 1800);
    }
}
