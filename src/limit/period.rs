//! Fixed-period request counter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::PeriodStore;
use super::manager::PeriodLimitDriver;
use super::option::{PeriodLimitConfig, PeriodOption};
use super::run_value::RunValue;
use crate::error::{LimitError, Result};

/// Default key prefix for period counters.
pub const DEFAULT_PERIOD_KEY_PREFIX: &str = "limit:period:";

/// Outcome of [`PeriodLimit::take`].
///
/// The ordering `Allowed < HitQuota < OverQuota` matches the store codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodLimitState {
    /// No recognised answer; paired with every error outcome
    #[default]
    Unknown,
    /// Below the quota
    Allowed,
    /// This request exactly reached the quota
    HitQuota,
    /// Past the quota
    OverQuota,
}

impl PeriodLimitState {
    /// Classify a raw store code.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PeriodLimitState::Allowed,
            1 => PeriodLimitState::HitQuota,
            2 => PeriodLimitState::OverQuota,
            _ => PeriodLimitState::Unknown,
        }
    }

    /// Convert back to the raw store code (`-1` for `Unknown`).
    pub fn to_code(&self) -> i64 {
        match self {
            PeriodLimitState::Unknown => -1,
            PeriodLimitState::Allowed => 0,
            PeriodLimitState::HitQuota => 1,
            PeriodLimitState::OverQuota => 2,
        }
    }

    pub fn is_allowed(&self) -> bool {
        *self == PeriodLimitState::Allowed
    }

    /// True only for the request that reached the quota.
    pub fn is_hit_quota(&self) -> bool {
        *self == PeriodLimitState::HitQuota
    }

    pub fn is_over_quota(&self) -> bool {
        *self == PeriodLimitState::OverQuota
    }
}

/// Limits requests per key during a period of time.
///
/// Holds no state of its own; concurrent callers, in this process or others,
/// are serialized by the store.
pub struct PeriodLimit<S: PeriodStore + ?Sized> {
    config: PeriodLimitConfig,
    store: Arc<S>,
}

impl<S: PeriodStore + ?Sized> PeriodLimit<S> {
    /// Create a limiter over `store`, applying `opts` in order to the defaults
    /// (one day, quota 6, prefix `limit:period:`, unaligned).
    pub fn new<I>(store: Arc<S>, opts: I) -> Self
    where
        I: IntoIterator<Item = PeriodOption>,
    {
        Self {
            config: PeriodLimitConfig::build(DEFAULT_PERIOD_KEY_PREFIX, opts),
            store,
        }
    }

    /// Get the configuration of this limiter.
    pub fn config(&self) -> &PeriodLimitConfig {
        &self.config
    }

    /// Request a permit for `key`.
    pub async fn take(&self, key: &str) -> Result<PeriodLimitState> {
        let key = self.config.format_key(key);
        let code = self
            .store
            .take(&key, self.config.quota(), self.config.expire_secs())
            .await?;

        let state = PeriodLimitState::from_code(code);
        trace!(key = %key, code, state = ?state, "Period limit taken");
        match state {
            PeriodLimitState::Unknown => Err(LimitError::UnknownCode),
            PeriodLimitState::HitQuota | PeriodLimitState::OverQuota => {
                debug!(key = %key, quota = self.config.quota(), state = ?state, "Period quota reached");
                Ok(state)
            }
            PeriodLimitState::Allowed => Ok(state),
        }
    }

    /// Mark `key` as having used its whole quota.
    ///
    /// Never shortens an existing expiry and never lowers a higher count.
    pub async fn set_quota_full(&self, key: &str) -> Result<()> {
        self.store
            .set_quota_full(
                &self.config.format_key(key),
                self.config.quota(),
                self.config.expire_secs(),
            )
            .await
    }

    /// Delete the counter for `key`.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.store.del(&self.config.format_key(key)).await
    }

    /// Read the counter for `key` without changing it.
    pub async fn get_run_value(&self, key: &str) -> Result<RunValue> {
        let raw = self.store.get_run_value(&self.config.format_key(key)).await?;
        RunValue::from_raw(&raw)
    }
}

#[async_trait]
impl<S: PeriodStore + ?Sized + 'static> PeriodLimitDriver for PeriodLimit<S> {
    async fn take(&self, key: &str) -> Result<PeriodLimitState> {
        PeriodLimit::take(self, key).await
    }

    async fn set_quota_full(&self, key: &str) -> Result<()> {
        PeriodLimit::set_quota_full(self, key).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        PeriodLimit::del(self, key).await
    }

    async fn get_run_value(&self, key: &str) -> Result<RunValue> {
        PeriodLimit::get_run_value(self, key).await
    }
}
