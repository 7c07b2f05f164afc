//! Configuration for the sync coordinator.

use std::env;
use std::time::Duration;

/// Coordinator timing and safety knobs.
///
/// Loaded from environment variables where present, with defaults suitable
/// for an interactive client.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay before a burst of updates triggers a send; reset by every new
    /// update so related changes coalesce into one run
    pub debounce: Duration,
    /// Interval of the periodic heartbeat send, which runs even with no
    /// changes (poll-based adapters, server reachability)
    pub heartbeat: Duration,
    /// Suspend heartbeat sends after this much user inactivity
    pub idle_threshold: Duration,
    /// Cut off a conflict-resolution chain once it has gone through this
    /// many consecutive rounds within one bucket
    pub max_resolution_rounds: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            heartbeat: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(30 * 60),
            max_resolution_rounds: 100,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            debounce: millis_var("FERRY_DEBOUNCE_MS", defaults.debounce)?,
            heartbeat: millis_var("FERRY_HEARTBEAT_MS", defaults.heartbeat)?,
            idle_threshold: millis_var("FERRY_IDLE_THRESHOLD_MS", defaults.idle_threshold)?,
            max_resolution_rounds: match env::var("FERRY_MAX_RESOLUTION_ROUNDS") {
                Ok(value) => value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("FERRY_MAX_RESOLUTION_ROUNDS"))?,
                Err(_) => defaults.max_resolution_rounds,
            },
        })
    }
}

fn millis_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}
