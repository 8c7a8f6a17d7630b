//! Token bucket limiter over a shared store, with an in-process rescue limiter.
//!
//! While the store answers, every decision is made by one atomic store call.
//! The first store error switches the limiter to its local `governor` bucket
//! and starts a single monitor task that pings the store every
//! [`TOKEN_PING_INTERVAL`]; the first successful ping switches it back.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::backend::TokenStore;

/// How often the monitor probes an unreachable store.
pub const TOKEN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Controls how frequently events may happen, up to `burst` at once and
/// `rate` per second on average.
///
/// Cloning is cheap and clones share the same state.
pub struct TokenLimit<S: TokenStore + ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: TokenStore + ?Sized> Clone for TokenLimit<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: ?Sized> {
    rate: NonZeroU32,
    burst: NonZeroU32,
    tokens_key: String,
    timestamp_key: String,
    /// Read lock-free on every call.
    store_alive: AtomicBool,
    /// Guards monitor start and stop.
    monitor_started: Mutex<bool>,
    monitors_spawned: AtomicU64,
    rescue_limiter: DefaultDirectRateLimiter,
    store: Arc<S>,
}

impl<S: TokenStore + ?Sized + 'static> TokenLimit<S> {
    /// Create a limiter allowing `rate` events per second with bursts of at
    /// most `burst`. The bucket lives at `{key}.tokens` and `{key}.ts`.
    pub fn new(rate: NonZeroU32, burst: NonZeroU32, key: &str, store: Arc<S>) -> Self {
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            inner: Arc::new(Inner {
                rate,
                burst,
                tokens_key: format!("{{{}}}.tokens", key),
                timestamp_key: format!("{{{}}}.ts", key),
                store_alive: AtomicBool::new(true),
                monitor_started: Mutex::new(false),
                monitors_spawned: AtomicU64::new(0),
                rescue_limiter: RateLimiter::direct(quota),
                store,
            }),
        }
    }

    pub fn rate(&self) -> NonZeroU32 {
        self.inner.rate
    }

    pub fn burst(&self) -> NonZeroU32 {
        self.inner.burst
    }

    /// Store keys holding the token count and the last refill time.
    pub fn keys(&self) -> (&str, &str) {
        (&self.inner.tokens_key, &self.inner.timestamp_key)
    }

    /// Whether decisions are currently made by the rescue limiter.
    pub fn is_degraded(&self) -> bool {
        !self.inner.store_alive.load(Ordering::Acquire)
    }

    /// Whether a monitor task is waiting for the store.
    pub fn is_monitor_running(&self) -> bool {
        *self.inner.monitor_started.lock()
    }

    /// Number of monitor tasks started over the limiter's lifetime.
    pub fn monitors_spawned(&self) -> u64 {
        self.inner.monitors_spawned.load(Ordering::Relaxed)
    }

    /// Shorthand for `allow_n(SystemTime::now(), 1)`.
    pub async fn allow(&self) -> bool {
        self.allow_n(SystemTime::now(), 1).await
    }

    /// Report whether `n` events may happen at `now`.
    ///
    /// Never fails: store errors of any kind, malformed replies and timeouts
    /// included, are logged and answered by the rescue limiter.
    pub async fn allow_n(&self, now: SystemTime, n: u32) -> bool {
        let inner = &self.inner;
        if !inner.store_alive.load(Ordering::Acquire) {
            return inner.rescue_allow(n);
        }

        let now_secs = DateTime::<Utc>::from(now).timestamp();
        match inner
            .store
            .allow_n(
                &inner.tokens_key,
                &inner.timestamp_key,
                inner.rate.get(),
                inner.burst.get(),
                now_secs,
                n,
            )
            .await
        {
            Ok(allowed) => {
                trace!(key = %inner.tokens_key, n, allowed, "Token limit checked");
                allowed
            }
            Err(err) => {
                warn!(
                    key = %inner.tokens_key,
                    error = %err,
                    "Failed to use token limit store, using in-process limiter for rescue"
                );
                self.start_monitor();
                inner.rescue_allow(n)
            }
        }
    }

    fn start_monitor(&self) {
        let mut started = self.inner.monitor_started.lock();
        if *started {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                // Stay live so the next call retries the store directly.
                warn!(error = %err, "No runtime to monitor the token limit store");
                return;
            }
        };

        *started = true;
        self.inner.store_alive.store(false, Ordering::Release);
        self.inner.monitors_spawned.fetch_add(1, Ordering::Relaxed);

        handle.spawn(Inner::wait_for_store(Arc::downgrade(&self.inner)));
    }
}

impl<S: TokenStore + ?Sized> Inner<S> {
    fn rescue_allow(&self, n: u32) -> bool {
        match NonZeroU32::new(n) {
            None => true,
            Some(n) => matches!(self.rescue_limiter.check_n(n), Ok(Ok(()))),
        }
    }

    /// Ping until the store answers. Exits early once every limiter handle
    /// is gone.
    async fn wait_for_store(inner: Weak<Self>) {
        let mut ticker = tokio::time::interval(TOKEN_PING_INTERVAL);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                debug!("Token limit dropped, stopping store monitor");
                return;
            };
            if inner.store.ping().await.is_ok() {
                inner.mark_alive();
                return;
            }
        }
    }

    fn mark_alive(&self) {
        let mut started = self.monitor_started.lock();
        self.store_alive.store(true, Ordering::Release);
        *started = false;
        info!(key = %self.tokens_key, "Token limit store is reachable again");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LimitError, Result};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures::future::join_all;

    fn nz(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// Store that replies with garbage but answers pings.
    struct MalformedStore;

    #[async_trait]
    impl TokenStore for MalformedStore {
        async fn allow_n(
            &self,
            _tokens_key: &str,
            _timestamp_key: &str,
            _rate: u32,
            _burst: u32,
            _now_secs: i64,
            _n: u32,
        ) -> Result<bool> {
            Err(LimitError::Backend("unexpected reply type".to_string()))
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Store that is always down and counts pings.
    #[derive(Default)]
    struct DownStore {
        pings: AtomicU64,
    }

    #[async_trait]
    impl TokenStore for DownStore {
        async fn allow_n(
            &self,
            _tokens_key: &str,
            _timestamp_key: &str,
            _rate: u32,
            _burst: u32,
            _now_secs: i64,
            _n: u32,
        ) -> Result<bool> {
            Err(LimitError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Err(LimitError::Unavailable("connection refused".to_string()))
        }
    }

    async fn wait_until_live<S: TokenStore + ?Sized + 'static>(limiter: &TokenLimit<S>) {
        for _ in 0..50 {
            if !limiter.is_degraded() && !limiter.is_monitor_running() {
                return;
            }
            tokio::time::sleep(TOKEN_PING_INTERVAL).await;
        }
        panic!("limiter did not recover");
    }

    #[test]
    fn test_keys() {
        let limiter = TokenLimit::new(nz(1), nz(1), "rate", Arc::new(MemoryStore::new()));
        assert_eq!(limiter.keys(), ("{rate}.tokens", "{rate}.ts"));
    }

    #[tokio::test]
    async fn test_allow_n_live() {
        let store = Arc::new(MemoryStore::new());
        let limiter = TokenLimit::new(nz(1), nz(2), "live", store.clone());

        assert!(limiter.allow_n(at(1000), 1).await);
        assert!(limiter.allow_n(at(1000), 1).await);
        assert!(!limiter.allow_n(at(1000), 1).await);

        assert!(limiter.allow_n(at(1001), 1).await);
        assert!(!limiter.allow_n(at(1001), 1).await);

        assert!(!limiter.is_degraded());
        assert_eq!(limiter.monitors_spawned(), 0);
        assert_eq!(store.get("{live}.ts").unwrap(), Some(1001));
    }

    #[tokio::test]
    async fn test_allow_shares_bucket_across_clones() {
        let store = Arc::new(MemoryStore::new());
        let limiter = TokenLimit::new(nz(1), nz(3), "shared", store.clone());
        let other = TokenLimit::new(nz(1), nz(3), "shared", store);

        assert!(limiter.allow_n(at(50), 2).await);
        assert!(other.allow_n(at(50), 1).await);
        assert!(!limiter.clone().allow_n(at(50), 1).await);
    }

    #[tokio::test]
    async fn test_rescue_respects_burst() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = TokenLimit::new(nz(1), nz(5), "rescue", store);

        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.allow().await {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
        assert!(limiter.is_degraded());
        assert!(limiter.is_monitor_running());
        assert_eq!(limiter.monitors_spawned(), 1);
    }

    #[tokio::test]
    async fn test_rescue_zero_events_always_allowed() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = TokenLimit::new(nz(1), nz(1), "zero", store);

        assert!(limiter.allow().await);
        assert!(limiter.allow_n(SystemTime::now(), 0).await);
        assert!(!limiter.allow_n(SystemTime::now(), 1).await);
        // More than the burst can never pass
        assert!(!limiter.allow_n(SystemTime::now(), 2).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_monitor_under_concurrent_failures() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = TokenLimit::new(nz(10), nz(10), "concurrent", store.clone());

        let calls = (0..100).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow().await })
        });
        let results = join_all(calls).await;

        let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        // Burst of 10, plus whatever refilled while the calls ran.
        assert!((10..=12).contains(&allowed), "rescue limiter allowed {} events", allowed);
        assert_eq!(limiter.monitors_spawned(), 1);
        assert!(limiter.is_degraded());

        store.set_available(true);
        wait_until_live(&limiter).await;
        assert_eq!(limiter.monitors_spawned(), 1);

        // A later outage starts a fresh monitor
        store.set_available(false);
        limiter.allow().await;
        assert!(limiter.is_degraded());
        assert_eq!(limiter.monitors_spawned(), 2);
    }

    #[tokio::test]
    async fn test_recovers_to_store() {
        let store = Arc::new(MemoryStore::new());
        let limiter = TokenLimit::new(nz(1), nz(1), "recover", store.clone());

        store.set_available(false);
        assert!(limiter.allow_n(at(10), 1).await);
        assert!(limiter.is_degraded());

        store.set_available(true);
        wait_until_live(&limiter).await;

        // Decisions come from the store again: its bucket is still full.
        assert!(limiter.allow_n(at(10), 1).await);
        assert!(!limiter.allow_n(at(10), 1).await);
        assert_eq!(store.get("{recover}.tokens").unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_limiter_dropped() {
        let store = Arc::new(DownStore::default());
        let limiter = TokenLimit::new(nz(1), nz(1), "dropped", store.clone());

        assert!(limiter.allow().await);
        assert!(limiter.is_monitor_running());

        tokio::time::sleep(TOKEN_PING_INTERVAL * 3).await;
        assert!(store.pings.load(Ordering::SeqCst) >= 2);

        drop(limiter);
        assert_eq!(Arc::strong_count(&store), 1);

        tokio::time::sleep(TOKEN_PING_INTERVAL * 2).await;
        let pings = store.pings.load(Ordering::SeqCst);
        tokio::time::sleep(TOKEN_PING_INTERVAL * 10).await;
        assert_eq!(store.pings.load(Ordering::SeqCst), pings);
    }

    #[tokio::test]
    async fn test_malformed_reply_degrades() {
        let limiter = TokenLimit::new(nz(1), nz(2), "malformed", Arc::new(MalformedStore));

        assert!(limiter.allow().await);
        assert_eq!(limiter.monitors_spawned(), 1);

        // Pings succeed, so the monitor flips straight back.
        wait_until_live(&limiter).await;
        assert!(!limiter.is_degraded());
    }
}
