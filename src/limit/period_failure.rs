//! Period counter of consecutive failures.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::PeriodFailureStore;
use super::manager::PeriodFailureLimitDriver;
use super::option::{PeriodLimitConfig, PeriodOption};
use super::run_value::RunValue;
use crate::error::{LimitError, Result};

/// Default key prefix for failure counters.
pub const DEFAULT_PERIOD_FAILURE_KEY_PREFIX: &str = "limit:period:failure:";

/// Outcome of [`PeriodFailureLimit::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodFailureLimitState {
    /// No recognised answer; paired with every error outcome
    #[default]
    Unknown,
    /// The outcome was a success and the counter was cleared
    Success,
    /// Failures are still within the quota
    InQuota,
    /// Failures passed the quota
    OverQuota,
}

impl PeriodFailureLimitState {
    /// Classify a raw store code.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PeriodFailureLimitState::Success,
            1 => PeriodFailureLimitState::InQuota,
            2 => PeriodFailureLimitState::OverQuota,
            _ => PeriodFailureLimitState::Unknown,
        }
    }

    /// Convert back to the raw store code (`-1` for `Unknown`).
    pub fn to_code(&self) -> i64 {
        match self {
            PeriodFailureLimitState::Unknown => -1,
            PeriodFailureLimitState::Success => 0,
            PeriodFailureLimitState::InQuota => 1,
            PeriodFailureLimitState::OverQuota => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == PeriodFailureLimitState::Success
    }

    pub fn is_within_quota(&self) -> bool {
        *self == PeriodFailureLimitState::InQuota
    }

    pub fn is_over_quota(&self) -> bool {
        *self == PeriodFailureLimitState::OverQuota
    }
}

/// Limits failures per key during a period of time.
///
/// Only failures count. A success clears the counter unless the key has
/// already used up its quota, in which case it stays locked until the period
/// ends or the key is deleted.
pub struct PeriodFailureLimit<S: PeriodFailureStore + ?Sized> {
    config: PeriodLimitConfig,
    store: Arc<S>,
}

impl<S: PeriodFailureStore + ?Sized> PeriodFailureLimit<S> {
    /// Create a limiter over `store`, applying `opts` in order to the defaults
    /// (one day, quota 6, prefix `limit:period:failure:`, unaligned).
    pub fn new<I>(store: Arc<S>, opts: I) -> Self
    where
        I: IntoIterator<Item = PeriodOption>,
    {
        Self {
            config: PeriodLimitConfig::build(DEFAULT_PERIOD_FAILURE_KEY_PREFIX, opts),
            store,
        }
    }

    /// Get the configuration of this limiter.
    pub fn config(&self) -> &PeriodLimitConfig {
        &self.config
    }

    /// Same as [`check`](Self::check) with `success = err.is_none()`.
    pub async fn check_err(
        &self,
        key: &str,
        err: Option<&(dyn StdError + Send + Sync)>,
    ) -> Result<PeriodFailureLimitState> {
        self.check(key, err.is_none()).await
    }

    /// Record the outcome of one attempt for `key`.
    pub async fn check(&self, key: &str, success: bool) -> Result<PeriodFailureLimitState> {
        let key = self.config.format_key(key);
        let code = self
            .store
            .check(&key, self.config.quota(), self.config.expire_secs(), success)
            .await?;

        let state = PeriodFailureLimitState::from_code(code);
        trace!(key = %key, success, code, state = ?state, "Period failure checked");
        match state {
            PeriodFailureLimitState::Unknown => Err(LimitError::UnknownCode),
            PeriodFailureLimitState::OverQuota => {
                debug!(key = %key, quota = self.config.quota(), "Failure quota exceeded");
                Ok(state)
            }
            _ => Ok(state),
        }
    }

    /// Mark `key` as having used its whole failure quota.
    pub async fn set_quota_full(&self, key: &str) -> Result<()> {
        self.store
            .set_quota_full(
                &self.config.format_key(key),
                self.config.quota(),
                self.config.expire_secs(),
            )
            .await
    }

    /// Delete the failure counter for `key`.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.store.del(&self.config.format_key(key)).await
    }

    /// Read the failure counter for `key` without changing it.
    pub async fn get_run_value(&self, key: &str) -> Result<RunValue> {
        let raw = self.store.get_run_value(&self.config.format_key(key)).await?;
        RunValue::from_raw(&raw)
    }
}

#[async_trait]
impl<S: PeriodFailureStore + ?Sized + 'static> PeriodFailureLimitDriver for PeriodFailureLimit<S> {
    async fn check_err(
        &self,
        key: &str,
        err: Option<&(dyn StdError + Send + Sync)>,
    ) -> Result<PeriodFailureLimitState> {
        PeriodFailureLimit::check_err(self, key, err).await
    }

    async fn check(&self, key: &str, success: bool) -> Result<PeriodFailureLimitState> {
        PeriodFailureLimit::check(self, key, success).await
    }

    async fn set_quota_full(&self, key: &str) -> Result<()> {
        PeriodFailureLimit::set_quota_full(self, key).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        PeriodFailureLimit::del(self, key).await
    }

    async fn get_run_value(&self, key: &str) -> Result<RunValue> {
        PeriodFailureLimit::get_run_value(self, key).await
    }
}
