//! Configuration for the ledger engine and batch driver.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::{ExchangeId, PointExchangeEntry};
use crate::policy::RewardPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("reward {0} must cost at least one point")]
    ZeroCostReward(ExchangeId),
}

/// Top-level ledger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Bonus points per operation kind
    pub rewards: RewardPolicy,

    /// Version-conflict retry budget
    pub retry: RetryConfig,

    /// Default deadline for a request, in milliseconds
    pub operation_timeout_ms: u64,

    /// Attempts at the log append once balances have committed
    pub log_append_attempts: u32,

    /// Durable transaction log location; in-memory when unset
    pub log_path: Option<PathBuf>,

    /// Durable account store location; in-memory when unset
    pub store_path: Option<PathBuf>,

    /// Redeemable rewards
    pub catalog: Vec<PointExchangeEntry>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rewards: RewardPolicy::default(),
            retry: RetryConfig::default(),
            operation_timeout_ms: 5_000,
            log_append_attempts: 3,
            log_path: None,
            store_path: None,
            catalog: Vec::new(),
        }
    }
}

/// Optimistic-concurrency retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// First backoff step (milliseconds), doubled per attempt
    pub base_backoff_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl LedgerConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()
    }

    /// Defaults with `LEDGER_*` environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `LEDGER_*` environment overrides on top of this config
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = lookup("LEDGER_LOG_PATH") {
            self.log_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("LEDGER_STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }

        if let Some(value) = lookup("LEDGER_OPERATION_TIMEOUT_MS") {
            self.operation_timeout_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "LEDGER_OPERATION_TIMEOUT_MS",
                value,
            })?;
        }

        if let Some(value) = lookup("LEDGER_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "LEDGER_RETRY_MAX_ATTEMPTS",
                value,
            })?;
        }

        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if let Some(entry) = self.catalog.iter().find(|e| e.cost_in_points.value() == 0) {
            return Err(ConfigError::ZeroCostReward(entry.id));
        }
        Ok(self)
    }
}
