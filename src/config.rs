// Configuration for the learning engine
// Sectioned TOML config with defaults matching the tuned production values

use crate::error::{PilotError, PilotResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// How `best_next_value` is modeled in the Q-learning update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    /// Every update is terminal: `best_next_value = 0`. The value estimate
    /// degenerates to an exponentially-weighted average of observed rewards.
    SingleStep,
    /// Intra-episode bootstrapping: each step's update is deferred until the
    /// next step of the same session is observed, and `best_next_value` is
    /// the stored value of the (tool, context) actually chosen next.
    /// Finalization flushes the pending update with a terminal zero.
    Bootstrap,
}

/// Q-learning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Learning rate (alpha) - how quickly new information overrides old
    pub learning_rate: f64,
    /// Discount factor (gamma) - importance of future rewards
    pub discount_factor: f64,
    /// `best_next_value` modeling choice
    pub update_mode: UpdateMode,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            update_mode: UpdateMode::SingleStep,
        }
    }
}

/// Exploration schedule for the selector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    /// Initial exploration rate (epsilon)
    pub rate: f64,
    /// Multiplicative decay applied after each single-pick selection
    pub decay: f64,
    /// Floor the exploration rate never decays below
    pub min_rate: f64,
    /// UCB1 exploration constant
    pub ucb_c: f64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            rate: 0.1,
            decay: 0.995,
            min_rate: 0.01,
            ucb_c: 2.0,
        }
    }
}

/// Ranking parameters for the recommender
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum samples before learned values influence confidence
    pub min_samples: u64,
    /// Scale of the logistic squashing applied to learned values
    pub q_scale: f64,
    /// Size of the exploit-ranked head; exploration promotes a tool from
    /// outside it
    pub top_set_size: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            q_scale: 3.0,
            top_set_size: 3,
        }
    }
}

/// Reward shaping weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Granted on success
    pub success_reward: f64,
    /// Deducted on failure; kept below `success_reward` in magnitude
    pub failure_penalty: f64,
    /// Weight applied to (rating - neutral_rating)
    pub rating_weight: f64,
    /// Rating that contributes nothing
    pub neutral_rating: f64,
    /// Penalty per second of latency
    pub latency_weight: f64,
    /// Cap on the total latency penalty, keeping rewards bounded
    pub max_latency_penalty: f64,
    /// Granted when latency beats the historical average
    pub efficiency_bonus: f64,
    /// Fraction of the historical average latency that earns the bonus
    pub efficiency_threshold: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            success_reward: 10.0,
            failure_penalty: 5.0,
            rating_weight: 2.0,
            neutral_rating: 3.0,
            latency_weight: 0.1,
            max_latency_penalty: 5.0,
            efficiency_bonus: 2.0,
            efficiency_threshold: 0.8,
        }
    }
}

/// Experience replay parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Whether batch replay updates run at all. Replayed experiences also
    /// increment visit counts, so this is opt-in.
    pub enabled: bool,
    /// Maximum experiences retained
    pub capacity: usize,
    /// Experiences per batch update
    pub batch_size: usize,
    /// A batch update runs every `interval` policy updates
    pub interval: u64,
    /// Priority exponent (0 = uniform sampling, 1 = full prioritization)
    pub priority_exponent: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 10_000,
            batch_size: 32,
            interval: 10,
            priority_exponent: 0.6,
        }
    }
}

/// Global configuration for the learning engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    pub learning: LearningConfig,
    pub exploration: ExplorationConfig,
    pub selection: SelectionConfig,
    pub reward: RewardConfig,
    pub replay: ReplayConfig,
    /// Seed for the engine RNG; when unset the OS entropy source is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
    /// SQLite database location; when unset the platform data directory is
    /// used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl RlConfig {
    /// Load configuration from a TOML file, or defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> PilotResult<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                let raw = fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            Some(path) => {
                return Err(PilotError::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )))
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the database file location, creating the default data
    /// directory if needed.
    pub fn resolve_database_path(&self) -> PilotResult<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let dir = dirs::data_dir()
            .ok_or_else(|| PilotError::config("could not determine data directory"))?
            .join("toolpilot");
        fs::create_dir_all(&dir)?;
        Ok(dir.join("toolpilot.db"))
    }

    /// Check parameter ranges
    pub fn validate(&self) -> PilotResult<()> {
        if !(0.0..=1.0).contains(&self.learning.learning_rate) || self.learning.learning_rate == 0.0
        {
            return Err(PilotError::config("learning_rate must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.learning.discount_factor) {
            return Err(PilotError::config("discount_factor must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.exploration.rate)
            || !(0.0..=1.0).contains(&self.exploration.min_rate)
        {
            return Err(PilotError::config("exploration rates must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.exploration.decay) || self.exploration.decay == 0.0 {
            return Err(PilotError::config("exploration decay must be in (0, 1]"));
        }
        if self.selection.min_samples == 0 {
            return Err(PilotError::config("min_samples must be at least 1"));
        }
        if self.selection.q_scale <= 0.0 {
            return Err(PilotError::config("q_scale must be positive"));
        }
        if self.reward.failure_penalty >= self.reward.success_reward {
            return Err(PilotError::config(
                "failure_penalty must stay below success_reward",
            ));
        }
        if self.replay.batch_size == 0 || self.replay.capacity == 0 || self.replay.interval == 0 {
            return Err(PilotError::config("replay parameters must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RlConfig::default();
        config.validate().unwrap();
        assert_eq!(config.learning.update_mode, UpdateMode::SingleStep);
        assert!((config.learning.learning_rate - 0.1).abs() < 1e-9);
        assert!((config.exploration.rate - 0.1).abs() < 1e-9);
        assert_eq!(config.selection.min_samples, 5);
        assert!(!config.replay.enabled);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config: RlConfig = toml::from_str(
            r#"
            rng_seed = 42

            [learning]
            learning_rate = 0.5
            update_mode = "bootstrap"

            [exploration]
            rate = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.rng_seed, Some(42));
        assert!((config.learning.learning_rate - 0.5).abs() < 1e-9);
        assert_eq!(config.learning.update_mode, UpdateMode::Bootstrap);
        assert!((config.exploration.rate - 0.25).abs() < 1e-9);
        // Untouched sections keep their defaults.
        assert!((config.learning.discount_factor - 0.9).abs() < 1e-9);
        assert_eq!(config.selection.min_samples, 5);
    }

    #[test]
    fn toml_round_trip() {
        let config = RlConfig::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: RlConfig = toml::from_str(&raw).unwrap();
        assert_eq!(
            parsed.learning.update_mode,
            config.learning.update_mode
        );
        assert!((parsed.reward.success_reward - config.reward.success_reward).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        let mut config = RlConfig::default();
        config.learning.learning_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = RlConfig::default();
        config.selection.min_samples = 0;
        assert!(config.validate().is_err());

        let mut config = RlConfig::default();
        config.reward.failure_penalty = 20.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = RlConfig::load(Some(Path::new("/nonexistent/toolpilot.toml"))).unwrap_err();
        assert!(matches!(err, PilotError::Config { .. }));
    }
}
