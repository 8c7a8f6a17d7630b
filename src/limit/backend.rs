//! Store traits abstracting the atomic operations each limiter needs.
//!
//! Every method must be a single atomic round trip against the backing store,
//! linearizable per key. Codes and TTL values are the raw wire values the
//! limiters classify.

use async_trait::async_trait;

use crate::error::Result;

/// Store operations backing a [`PeriodLimit`](super::PeriodLimit).
#[async_trait]
pub trait PeriodStore: Send + Sync {
    /// Increment the counter, setting `expire_secs` when the increment created it.
    ///
    /// Returns `0` while the count is below `quota`, `1` when it equals `quota`
    /// and `2` once it is above.
    async fn take(&self, key: &str, quota: u64, expire_secs: u64) -> Result<i64>;

    /// Raise the counter to `quota` without shortening an existing expiry.
    async fn set_quota_full(&self, key: &str, quota: u64, expire_secs: u64) -> Result<()>;

    /// Delete the counter.
    async fn del(&self, key: &str) -> Result<()>;

    /// Read `[0]` for an absent key or `[exists, count, ttl]` otherwise.
    async fn get_run_value(&self, key: &str) -> Result<Vec<i64>>;
}

/// Store operations backing a [`PeriodFailureLimit`](super::PeriodFailureLimit).
#[async_trait]
pub trait PeriodFailureStore: Send + Sync {
    /// Record one outcome.
    ///
    /// A success clears a counter that is still below `quota` and returns `0`.
    /// A failure increments it (setting `expire_secs` on creation) and returns
    /// `1` while the count is at most `quota`, `2` after. A success against a
    /// counter at or above `quota` leaves it untouched and returns `2`.
    async fn check(&self, key: &str, quota: u64, expire_secs: u64, success: bool) -> Result<i64>;

    /// Raise the counter to `quota` without shortening an existing expiry.
    async fn set_quota_full(&self, key: &str, quota: u64, expire_secs: u64) -> Result<()>;

    /// Delete the counter.
    async fn del(&self, key: &str) -> Result<()>;

    /// Read `[0]` for an absent key or `[exists, count, ttl]` otherwise.
    async fn get_run_value(&self, key: &str) -> Result<Vec<i64>>;
}

/// Store operations backing a [`TokenLimit`](super::TokenLimit).
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Refill the bucket for the time elapsed since `timestamp_key` and try to
    /// deduct `n` tokens, all in one atomic step.
    async fn allow_n(
        &self,
        tokens_key: &str,
        timestamp_key: &str,
        rate: u32,
        burst: u32,
        now_secs: i64,
        n: u32,
    ) -> Result<bool>;

    /// Liveness probe used while the limiter runs on its rescue limiter.
    async fn ping(&self) -> Result<()>;
}
