//! Configuration management for the limiters.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimitError, Result};
use crate::limit::{PeriodOption, DEFAULT_PERIOD_FAILURE_KEY_PREFIX, DEFAULT_PERIOD_KEY_PREFIX};

/// Top-level limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Request counter settings
    #[serde(default = "default_period")]
    pub period: PeriodSettings,

    /// Failure counter settings
    #[serde(default = "default_period_failure")]
    pub period_failure: PeriodSettings,

    /// Token bucket settings
    #[serde(default)]
    pub token: TokenSettings,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            period_failure: default_period_failure(),
            token: TokenSettings::default(),
        }
    }
}

fn default_period() -> PeriodSettings {
    PeriodSettings::with_prefix(DEFAULT_PERIOD_KEY_PREFIX)
}

fn default_period_failure() -> PeriodSettings {
    PeriodSettings::with_prefix(DEFAULT_PERIOD_FAILURE_KEY_PREFIX)
}

/// Settings of a period or period failure limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSettings {
    /// Namespace of the counter keys; empty keeps the limiter's default
    #[serde(default)]
    pub key_prefix: String,

    /// Counting period in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Quota per period
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Reset at local-timezone period boundaries
    #[serde(default)]
    pub align: bool,
}

impl PeriodSettings {
    fn with_prefix(key_prefix: &str) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            period_secs: default_period_secs(),
            quota: default_quota(),
            align: false,
        }
    }

    /// The ordered option list these settings stand for.
    pub fn to_options(&self) -> Vec<PeriodOption> {
        let mut opts = Vec::with_capacity(4);
        if !self.key_prefix.is_empty() {
            opts.push(PeriodOption::KeyPrefix(self.key_prefix.clone()));
        }
        opts.push(PeriodOption::Period(Duration::from_secs(self.period_secs)));
        opts.push(PeriodOption::Quota(self.quota));
        if self.align {
            opts.push(PeriodOption::Align);
        }
        opts
    }
}

fn default_period_secs() -> u64 {
    86400
}

fn default_quota() -> u64 {
    6
}

/// Token bucket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSettings {
    /// Logical bucket key
    #[serde(default = "default_token_key")]
    pub key: String,

    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Bucket size
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            key: default_token_key(),
            rate: default_rate(),
            burst: default_burst(),
        }
    }
}

impl TokenSettings {
    /// Validated `(rate, burst)`.
    pub fn rate_and_burst(&self) -> Result<(NonZeroU32, NonZeroU32)> {
        let rate = NonZeroU32::new(self.rate)
            .ok_or_else(|| LimitError::Config("token rate must be positive".to_string()))?;
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| LimitError::Config("token burst must be positive".to_string()))?;
        Ok((rate, burst))
    }
}

fn default_token_key() -> String {
    "limit:token".to_string()
}

fn default_rate() -> u32 {
    10
}

fn default_burst() -> u32 {
    20
}

impl LimiterConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimitError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.token.rate_and_burst()?;
        Ok(config)
    }
}
