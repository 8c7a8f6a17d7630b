//! In-process store implementing every limiter contract.
//!
//! All operations run under one mutex, which makes each of them atomic and
//! linearizable across keys. Expired keys are dropped lazily when touched.
//! TTLs follow the Redis convention: `-2` for a missing key, `-1` for a key
//! without expiry, otherwise the remaining whole seconds rounded up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{LimitError, Result};
use crate::limit::backend::{PeriodFailureStore, PeriodStore, TokenStore};
use crate::limit::run_value::{TTL_MISSING, TTL_NO_EXPIRY};

/// Period codes written by `take`.
const CODE_ALLOWED: i64 = 0;
const CODE_HIT_QUOTA: i64 = 1;
const CODE_OVER_QUOTA: i64 = 2;

/// Failure codes written by `check`.
const CODE_SUCCESS: i64 = 0;
const CODE_IN_QUOTA: i64 = 1;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn ttl_raw(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => TTL_NO_EXPIRY,
            Some(at) => {
                let remaining = at.saturating_duration_since(now).as_millis();
                remaining.div_ceil(1000) as i64
            }
        }
    }
}

type Entries = HashMap<String, Entry>;

/// A shared, linearizable in-memory key-value store.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, reachable store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away or coming back.
    ///
    /// While unavailable every operation, `ping` included, fails with
    /// [`LimitError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        debug!(available, "Memory store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the store currently answers requests.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Raw integer value of a key, if it exists.
    pub fn get(&self, key: &str) -> Result<Option<i64>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(live(&mut entries, key, now).map(|e| e.value))
    }

    /// Raw TTL of a key.
    pub fn ttl(&self, key: &str) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(live(&mut entries, key, now).map_or(TTL_MISSING, |e| e.ttl_raw(now)))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired(now));
        entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(LimitError::Unavailable("memory store is offline".to_string()))
        }
    }

    /// Increment a key by one, setting the expiry when the key was created.
    fn incr_with_expiry(
        entries: &mut Entries,
        key: &str,
        expire_secs: u64,
        now: Instant,
    ) -> Result<i64> {
        match live(entries, key, now) {
            Some(entry) => {
                entry.value = entry.value.saturating_add(1);
                Ok(entry.value)
            }
            None => {
                let expires_at = expiry(now, expire_secs)?;
                entries.insert(key.to_string(), Entry {
                    value: 1,
                    expires_at: Some(expires_at),
                });
                Ok(1)
            }
        }
    }

    fn set_quota_full_locked(&self, key: &str, quota: u64, expire_secs: u64) -> Result<()> {
        self.ensure_available()?;
        let now = Instant::now();
        let quota = quota_value(quota)?;
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            Some(entry) if entry.value < quota => entry.value = quota,
            Some(_) => {}
            None => {
                let expires_at = expiry(now, expire_secs)?;
                entries.insert(key.to_string(), Entry {
                    value: quota,
                    expires_at: Some(expires_at),
                });
            }
        }
        trace!(key = %key, quota, "Counter raised to quota");
        Ok(())
    }

    fn del_locked(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    fn run_value_locked(&self, key: &str) -> Result<Vec<i64>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(match live(&mut entries, key, now) {
            Some(entry) => vec![1, entry.value, entry.ttl_raw(now)],
            None => vec![0],
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Expiry instant of a key created at `now`.
fn expiry(now: Instant, expire_secs: u64) -> Result<Instant> {
    now.checked_add(Duration::from_secs(expire_secs)).ok_or_else(|| {
        LimitError::Backend(format!("expiry of {} seconds is out of range", expire_secs))
    })
}

fn quota_value(quota: u64) -> Result<i64> {
    i64::try_from(quota)
        .map_err(|_| LimitError::Backend(format!("quota {} is out of range", quota)))
}

/// Look up a key, evicting it first if it has expired.
fn live<'a>(entries: &'a mut Entries, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl PeriodStore for MemoryStore {
    async fn take(&self, key: &str, quota: u64, expire_secs: u64) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let quota = quota_value(quota)?;
        let current = {
            let mut entries = self.entries.lock();
            Self::incr_with_expiry(&mut entries, key, expire_secs, now)?
        };

        Ok(if current < quota {
            CODE_ALLOWED
        } else if current == quota {
            CODE_HIT_QUOTA
        } else {
            CODE_OVER_QUOTA
        })
    }

    async fn set_quota_full(&self, key: &str, quota: u64, expire_secs: u64) -> Result<()> {
        self.set_quota_full_locked(key, quota, expire_secs)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.del_locked(key)
    }

    async fn get_run_value(&self, key: &str) -> Result<Vec<i64>> {
        self.run_value_locked(key)
    }
}

#[async_trait]
impl PeriodFailureStore for MemoryStore {
    async fn check(&self, key: &str, quota: u64, expire_secs: u64, success: bool) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let quota = quota_value(quota)?;
        let mut entries = self.entries.lock();

        if success {
            let current = live(&mut entries, key, now).map(|e| e.value);
            return Ok(match current {
                None => CODE_SUCCESS,
                Some(current) if current < quota => {
                    entries.remove(key);
                    CODE_SUCCESS
                }
                Some(_) => CODE_OVER_QUOTA,
            });
        }

        let current = Self::incr_with_expiry(&mut entries, key, expire_secs, now)?;
        Ok(if current <= quota {
            CODE_IN_QUOTA
        } else {
            CODE_OVER_QUOTA
        })
    }

    async fn set_quota_full(&self, key: &str, quota: u64, expire_secs: u64) -> Result<()> {
        self.set_quota_full_locked(key, quota, expire_secs)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.del_locked(key)
    }

    async fn get_run_value(&self, key: &str) -> Result<Vec<i64>> {
        self.run_value_locked(key)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn allow_n(
        &self,
        tokens_key: &str,
        timestamp_key: &str,
        rate: u32,
        burst: u32,
        now_secs: i64,
        n: u32,
    ) -> Result<bool> {
        self.ensure_available()?;
        if rate == 0 {
            return Err(LimitError::Backend("token bucket rate must be positive".to_string()));
        }
        let now = Instant::now();
        let rate = i64::from(rate);
        let burst = i64::from(burst);
        let ttl_secs = ((2 * burst) / rate).max(1) as u64;

        let mut entries = self.entries.lock();
        let last_tokens = live(&mut entries, tokens_key, now).map_or(burst, |e| e.value);
        let last_refreshed = live(&mut entries, timestamp_key, now).map_or(0, |e| e.value);

        let delta = now_secs.saturating_sub(last_refreshed).max(0);
        let filled = burst.min(last_tokens.saturating_add(delta.saturating_mul(rate)));
        let allowed = filled >= i64::from(n);
        let remaining = if allowed { filled - i64::from(n) } else { filled };

        let expires_at = Some(expiry(now, ttl_secs)?);
        entries.insert(tokens_key.to_string(), Entry { value: remaining, expires_at });
        entries.insert(timestamp_key.to_string(), Entry { value: now_secs, expires_at });

        trace!(
            tokens_key = %tokens_key,
            filled,
            remaining,
            allowed,
            "Token bucket evaluated"
        );
        Ok(allowed)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }
}
