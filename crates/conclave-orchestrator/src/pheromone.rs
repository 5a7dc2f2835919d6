//! Time-decayed reputation ("pheromone") arithmetic.
//!
//! Scores live in `[0, 1]`. Between interactions a score evaporates toward a
//! floor; each interaction deposits its outcome as an exponential moving
//! average, so older outcomes weigh geometrically less than newer ones.
//! Every function takes `now` explicitly so that decay is testable without
//! waiting.

use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};

/// `[router.pheromone]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PheromoneConfig {
    /// Score given to a newly registered agent.
    #[serde(default = "default_initial")]
    pub initial: f64,
    /// Evaporation never takes a score below this value.
    #[serde(default = "default_floor")]
    pub floor: f64,
    /// Fraction of the above-floor score retained per hour of inactivity.
    #[serde(default = "default_decay_per_hour")]
    pub decay_per_hour: f64,
    /// Weight of a new outcome in the moving average.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

fn default_initial() -> f64 {
    0.5
}

fn default_floor() -> f64 {
    0.1
}

fn default_decay_per_hour() -> f64 {
    0.95
}

fn default_learning_rate() -> f64 {
    0.3
}

impl Default for PheromoneConfig {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            floor: default_floor(),
            decay_per_hour: default_decay_per_hour(),
            learning_rate: default_learning_rate(),
        }
    }
}

impl PheromoneConfig {
    pub fn validate(&self) -> ConclaveResult<()> {
        if !(0.0..=1.0).contains(&self.initial) {
            return Err(ConclaveError::Config(
                "pheromone.initial must be within [0, 1]".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.floor) {
            return Err(ConclaveError::Config(
                "pheromone.floor must be within [0, 1)".into(),
            ));
        }
        if !(self.decay_per_hour > 0.0 && self.decay_per_hour < 1.0) {
            return Err(ConclaveError::Config(
                "pheromone.decay_per_hour must be within (0, 1)".into(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(ConclaveError::Config(
                "pheromone.learning_rate must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Score after evaporating from `updated_at` until `now`.
///
/// Strictly decreasing over time while above the floor; a score at or below
/// the floor is returned unchanged. Clock skew (`now` before `updated_at`)
/// counts as no elapsed time.
pub fn evaporate(
    score: f64,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &PheromoneConfig,
) -> f64 {
    if score <= config.floor {
        return score;
    }
    let elapsed_ms = (now - updated_at).num_milliseconds().max(0) as f64;
    let hours = elapsed_ms / 3_600_000.0;
    config.floor + (score - config.floor) * config.decay_per_hour.powf(hours)
}

/// Fold one outcome into an (already evaporated) score.
pub fn deposit(current: f64, outcome: f64, config: &PheromoneConfig) -> f64 {
    let outcome = outcome.clamp(0.0, 1.0);
    (current + config.learning_rate * (outcome - current)).clamp(0.0, 1.0)
}
