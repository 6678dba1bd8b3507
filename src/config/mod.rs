//! Runtime configuration.
//!
//! Config structs deserialize from YAML files and environment variables and
//! carry explicit defaults, so an empty config is a working one. Per-saga
//! overrides nest under `worker.sagas.<name>`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::{Backoff, RetryPolicy};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "edda.yaml";
/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "EDDA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EDDA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EDDA_LOG";

const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_DLQ_SUFFIX: &str = ".dlq";
const DEFAULT_MIN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAX_TIMEOUT_MS: u64 = 604_800_000; // 7 days
const DEFAULT_REAPER_POLL_INTERVAL_MS: u64 = 500;

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Worker configuration.
    pub worker: WorkerConfig,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `edda.yaml` in the current directory (if present)
    /// 2. File given by `path` (if provided)
    /// 3. File given by `EDDA_CONFIG` (if set)
    /// 4. Environment variables with the `EDDA` prefix, `__` separator
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Per-subscription in-flight cap.
    pub default_concurrency: usize,
    /// Hard drain deadline for `stop()`.
    pub shutdown_timeout_ms: u64,
    /// Default retry policy.
    pub retry: RetryPolicyConfig,
    /// Dead-letter endpoint suffix appended to the origin endpoint.
    pub dlq_suffix: String,
    /// Allowed range for scheduled delays and saga-level timeouts.
    pub timeout_bounds: TimeoutBounds,
    /// What to do with an envelope no saga instance accepts.
    pub on_correlation_failure: CorrelationFailurePolicy,
    /// Poll interval for the persisted-timeout reaper.
    pub reaper_poll_interval_ms: u64,
    /// Per-saga overrides, keyed by saga name.
    pub sagas: HashMap<String, SagaOverrides>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_CONCURRENCY,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            retry: RetryPolicyConfig::default(),
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            timeout_bounds: TimeoutBounds::default(),
            on_correlation_failure: CorrelationFailurePolicy::default(),
            reaper_poll_interval_ms: DEFAULT_REAPER_POLL_INTERVAL_MS,
            sagas: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Subscription concurrency for a saga, honouring its override.
    pub fn concurrency_for(&self, saga_name: &str) -> usize {
        self.sagas
            .get(saga_name)
            .and_then(|s| s.concurrency)
            .unwrap_or(self.default_concurrency)
    }

    /// Retry policy for a saga, honouring its override.
    pub fn retry_for(&self, saga_name: &str) -> RetryPolicy {
        self.sagas
            .get(saga_name)
            .and_then(|s| s.retry.as_ref())
            .unwrap_or(&self.retry)
            .policy()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn reaper_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_poll_interval_ms)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Attempts before routing to the DLQ.
    pub max_attempts: u32,
    /// Initial backoff delay.
    pub base_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Backoff curve.
    pub backoff: Backoff,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicyConfig {
    /// Materialize the computed policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            backoff: self.backoff,
        }
    }
}

/// Clamp range for scheduled delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutBounds {
    pub min_ms: u64,
    pub max_ms: u64,
    /// When true, out-of-range delays are clamped instead of rejected.
    pub clamp_out_of_range: bool,
}

impl Default for TimeoutBounds {
    fn default() -> Self {
        Self {
            min_ms: DEFAULT_MIN_TIMEOUT_MS,
            max_ms: DEFAULT_MAX_TIMEOUT_MS,
            clamp_out_of_range: false,
        }
    }
}

impl TimeoutBounds {
    /// Validate a delay: `Some(delay)` when accepted (possibly clamped),
    /// `None` when rejected.
    pub fn resolve(&self, delay_ms: u64) -> Option<u64> {
        if (self.min_ms..=self.max_ms).contains(&delay_ms) {
            Some(delay_ms)
        } else if self.clamp_out_of_range {
            Some(delay_ms.clamp(self.min_ms, self.max_ms))
        } else {
            None
        }
    }
}

/// Policy for envelopes that correlate to no live saga instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationFailurePolicy {
    /// Ack and discard.
    #[default]
    Drop,
    /// Route to the dead-letter endpoint.
    Dlq,
}

/// Per-saga configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SagaOverrides {
    pub concurrency: Option<usize>,
    pub retry: Option<RetryPolicyConfig>,
}
