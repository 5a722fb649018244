//! Download configuration, loadable from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. CLI flags are applied on top of whatever is loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use klinefetch_core::exchange::binance::{BinanceConfig, Credentials, DEFAULT_BASE_URL};
use klinefetch_core::{KlinePaginator, RetryPolicy, TimestampStyle};

/// The exchange rejects klines requests asking for more rows than this.
pub const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Rows requested per klines call.
    pub limit: u32,

    /// Worker threads for symbol tasks. `None` runs one worker per symbol.
    pub max_concurrency: Option<usize>,

    /// Timezone used when rendering timestamps into CSV files.
    pub timestamp_style: TimestampStyle,

    pub exchange: ExchangeSettings,

    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            limit: KlinePaginator::DEFAULT_LIMIT,
            max_concurrency: None,
            timestamp_style: TimestampStyle::Local,
            exchange: ExchangeSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "limit must be between 1 and {MAX_LIMIT}, got {}",
                self.limit
            )));
        }
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.multiplier == 0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_factor must be within [0, 1], got {}",
                self.retry.jitter_factor
            )));
        }
        if self.exchange.timeout_secs == 0 {
            return Err(ConfigError::Invalid("exchange.timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// Connection settings for the Binance client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    pub min_request_interval_ms: u64,
    pub breaker_cooldown_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            min_request_interval_ms: 50,
            breaker_cooldown_secs: 30 * 60,
        }
    }
}

impl ExchangeSettings {
    pub fn to_binance_config(&self, credentials: Credentials) -> BinanceConfig {
        BinanceConfig {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(self.timeout_secs),
            min_request_interval: Duration::from_millis(self.min_request_interval_ms),
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            credentials,
        }
    }
}
