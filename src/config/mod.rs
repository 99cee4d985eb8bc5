//! Configuration for the request governor.
//!
//! Every section has conservative defaults and `with_*` builder methods.
//! [`GovernorConfig::load`] layers an optional TOML file and `PAGEGIST__*`
//! environment variables over the defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix for environment overrides, e.g. `PAGEGIST__BUDGET__TOKEN_LIMIT=90000`.
pub const ENV_PREFIX: &str = "PAGEGIST";

/// Separator between nested keys in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Default cache directory, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = ".pagegist/cache";

/// Resource key used for the text-generation service in the concurrency gate.
pub const TEXT_GENERATION_RESOURCE: &str = "text-generation";

/// Serde helper storing a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (val.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Token budget settings for the rolling-window scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Tokens allowed per window until the server reports otherwise.
    pub token_limit: u64,

    /// Length of the rolling window.
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,

    /// How long usage records are kept past the accounting window.
    #[serde(rename = "retention_ms", with = "duration_ms")]
    pub retention: Duration,

    /// Delay before re-running admission when nothing else will wake the queue.
    #[serde(rename = "recheck_interval_ms", with = "duration_ms")]
    pub recheck_interval: Duration,

    /// Once a request that does not fit has waited this long, nothing behind
    /// it is admitted until it is.
    #[serde(rename = "reserve_after_ms", with = "duration_ms")]
    pub reserve_after: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_limit: 40_000,
            window: Duration::from_secs(60),
            retention: Duration::from_secs(60),
            recheck_interval: Duration::from_secs(3),
            reserve_after: Duration::from_secs(60),
        }
    }
}

impl BudgetConfig {
    /// Set the initial token limit.
    pub fn with_token_limit(mut self, tokens: u64) -> Self {
        self.token_limit = tokens;
        self
    }

    /// Set the rolling window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set how long usage is retained past the window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the fallback re-check delay.
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Set the head-of-line reservation age.
    pub fn with_reserve_after(mut self, age: Duration) -> Self {
        self.reserve_after = age;
        self
    }
}

/// Settings for retrying transient transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum transport attempts for transient failures (throttling excluded).
    pub max_attempts: u32,

    /// Throttled rejections tolerated for one payload before giving up.
    pub max_throttled_attempts: u32,

    /// Backoff unit; attempt `n` waits `n * base_delay`.
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,

    /// Upper bound for a single backoff delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_throttled_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set how many throttled rejections are tolerated.
    pub fn with_max_throttled_attempts(mut self, attempts: u32) -> Self {
        self.max_throttled_attempts = attempts.max(1);
        self
    }

    /// Set the backoff unit.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the retry following failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

/// Concurrency ceilings per resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Limit for keys without an explicit entry.
    pub default_limit: usize,

    /// Limit applied to web origins (`scheme://host[:port]`).
    pub origin_limit: usize,

    /// Explicit per-key limits.
    pub limits: HashMap<String, usize>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_limit: 8,
            origin_limit: 1,
            limits: HashMap::new(),
        }
    }
}

impl GateConfig {
    /// Set the limit for a specific resource key.
    pub fn with_limit(mut self, resource: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(resource.into(), limit.max(1));
        self
    }

    /// Set the limit for keys without an explicit entry.
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    /// Set the limit for web origins.
    pub fn with_origin_limit(mut self, limit: usize) -> Self {
        self.origin_limit = limit.max(1);
        self
    }

    /// Limit for a resource key, falling back to the origin or default limit.
    pub fn limit_for(&self, resource: &str) -> usize {
        if let Some(limit) = self.limits.get(resource) {
            return (*limit).max(1);
        }
        if resource.starts_with("http://") || resource.starts_with("https://") {
            self.origin_limit.max(1)
        } else {
            self.default_limit.max(1)
        }
    }
}

/// Durable response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one file per cached digest.
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

/// Token estimation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Multiplier applied on top of the heuristic estimate (>= 1.0).
    pub safety_margin: f64,

    /// Fixed overhead per chat message.
    pub message_overhead: u64,

    /// Tokens reserved for the generated completion.
    pub completion_allowance: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            safety_margin: 1.2,
            message_overhead: 4,
            completion_allowance: 0,
        }
    }
}

/// Top-level configuration for a [`RequestGovernor`](crate::governor::RequestGovernor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
    pub gates: GateConfig,
    pub cache: CacheConfig,
    pub estimator: EstimatorConfig,
}

impl GovernorConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let merged = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;
        let loaded: Self = merged.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document, without environment overrides.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.token_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "budget.token_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.budget.window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "budget.window_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least one".to_string(),
            });
        }
        if self.retry.max_throttled_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_throttled_attempts",
                reason: "must be at least one".to_string(),
            });
        }
        Ok(())
    }

    /// Set the budget section.
    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// Set the retry section.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the gate section.
    pub fn with_gates(mut self, gates: GateConfig) -> Self {
        self.gates = gates;
        self
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = dir.into();
        self
    }

    /// Set the estimator section.
    pub fn with_estimator(mut self, estimator: EstimatorConfig) -> Self {
        self.estimator = estimator;
        self
    }
}
