//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::Algorithm;

/// Prefix for environment overrides, e.g. `TURNSTILE__REAPER__INTERVAL_SECS`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Reaper configuration
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Algorithm used when a call or policy does not pick one
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Number of lock shards in the counter store (power of two)
    #[serde(default)]
    pub shard_amount: Option<usize>,

    /// Distinct keys held before the reaper is woken early
    #[serde(default)]
    pub max_keys: Option<usize>,

    /// Path to the per-action policy file
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Whether to run the background reaper at all
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,

    /// Sweep interval in seconds
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,

    /// How long a stale record is kept before eviction, in seconds
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_secs: default_reaper_interval(),
            grace_period_secs: default_grace_period(),
        }
    }
}

impl ReaperConfig {
    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace period before a stale record is evicted.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn default_reaper_enabled() -> bool {
    true
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter or reaper cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.reaper.enabled && self.reaper.interval_secs == 0 {
            return Err(TurnstileError::InvalidConfig(
                "reaper.interval_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(shards) = self.limiter.shard_amount {
            if shards < 2 || !shards.is_power_of_two() {
                return Err(TurnstileError::InvalidConfig(format!(
                    "limiter.shard_amount must be a power of two greater than one, got {}",
                    shards
                )));
            }
        }

        Ok(())
    }
}
