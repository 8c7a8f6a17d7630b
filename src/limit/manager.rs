//! Driver registries selecting a limiter implementation by kind.
//!
//! A process serving many tenants or backends registers one driver per kind
//! and looks it up per request. Lookups never fail: unknown kinds resolve to a
//! sentinel driver whose every operation returns
//! [`LimitError::UnsupportedDriver`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::period::PeriodLimitState;
use super::period_failure::PeriodFailureLimitState;
use super::run_value::RunValue;
use crate::error::{LimitError, Result};

/// Object-safe interface of a period limiter.
#[async_trait]
pub trait PeriodLimitDriver: Send + Sync {
    /// Request a permit, returning the permit state.
    async fn take(&self, key: &str) -> Result<PeriodLimitState>;
    /// Mark the key as having used its whole quota.
    async fn set_quota_full(&self, key: &str) -> Result<()>;
    /// Delete the counter.
    async fn del(&self, key: &str) -> Result<()>;
    /// Read the counter without changing it.
    async fn get_run_value(&self, key: &str) -> Result<RunValue>;
}

/// Object-safe interface of a period failure limiter.
#[async_trait]
pub trait PeriodFailureLimitDriver: Send + Sync {
    /// Same as `check` with `success = err.is_none()`.
    async fn check_err(
        &self,
        key: &str,
        err: Option<&(dyn StdError + Send + Sync)>,
    ) -> Result<PeriodFailureLimitState>;
    /// Record the outcome of one attempt.
    async fn check(&self, key: &str, success: bool) -> Result<PeriodFailureLimitState>;
    /// Mark the key as having used its whole failure quota.
    async fn set_quota_full(&self, key: &str) -> Result<()>;
    /// Delete the counter.
    async fn del(&self, key: &str) -> Result<()>;
    /// Read the counter without changing it.
    async fn get_run_value(&self, key: &str) -> Result<RunValue>;
}

/// Period driver answered for unregistered kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedPeriodLimitDriver;

#[async_trait]
impl PeriodLimitDriver for UnsupportedPeriodLimitDriver {
    async fn take(&self, _key: &str) -> Result<PeriodLimitState> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn set_quota_full(&self, _key: &str) -> Result<()> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn get_run_value(&self, _key: &str) -> Result<RunValue> {
        Err(LimitError::UnsupportedDriver)
    }
}

/// Period failure driver answered for unregistered kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedPeriodFailureLimitDriver;

#[async_trait]
impl PeriodFailureLimitDriver for UnsupportedPeriodFailureLimitDriver {
    async fn check_err(
        &self,
        _key: &str,
        _err: Option<&(dyn StdError + Send + Sync)>,
    ) -> Result<PeriodFailureLimitState> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn check(&self, _key: &str, _success: bool) -> Result<PeriodFailureLimitState> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn set_quota_full(&self, _key: &str) -> Result<()> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Err(LimitError::UnsupportedDriver)
    }

    async fn get_run_value(&self, _key: &str) -> Result<RunValue> {
        Err(LimitError::UnsupportedDriver)
    }
}

/// Driver interfaces that have an always-failing sentinel implementation.
pub trait Unsupported {
    /// A fresh sentinel driver.
    fn unsupported() -> Arc<Self>;
}

impl Unsupported for dyn PeriodLimitDriver {
    fn unsupported() -> Arc<Self> {
        Arc::new(UnsupportedPeriodLimitDriver)
    }
}

impl Unsupported for dyn PeriodFailureLimitDriver {
    fn unsupported() -> Arc<Self> {
        Arc::new(UnsupportedPeriodFailureLimitDriver)
    }
}

/// Concurrency-safe map from a kind to a driver.
///
/// The sentinel is created once per registry, so every miss returns the same
/// `Arc`.
pub struct DriverRegistry<K, D: ?Sized> {
    drivers: RwLock<HashMap<K, Arc<D>>>,
    unsupported: Arc<D>,
}

/// Registry of period limiter drivers.
pub type PeriodLimitManager<K = String> = DriverRegistry<K, dyn PeriodLimitDriver>;

/// Registry of period failure limiter drivers.
pub type PeriodFailureLimitManager<K = String> = DriverRegistry<K, dyn PeriodFailureLimitDriver>;

impl<K, D> DriverRegistry<K, D>
where
    K: Eq + Hash,
    D: ?Sized + Unsupported,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_unsupported(D::unsupported())
    }

    /// Create a registry pre-seeded with `drivers`.
    ///
    /// Later entries for the same kind replace earlier ones.
    pub fn with_drivers<I>(drivers: I) -> Self
    where
        I: IntoIterator<Item = (K, Arc<D>)>,
    {
        let registry = Self::new();
        registry.drivers.write().extend(drivers);
        registry
    }
}

impl<K, D> Default for DriverRegistry<K, D>
where
    K: Eq + Hash,
    D: ?Sized + Unsupported,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, D> DriverRegistry<K, D>
where
    K: Eq + Hash,
    D: ?Sized,
{
    /// Create an empty registry answering misses with `unsupported`.
    pub fn with_unsupported(unsupported: Arc<D>) -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            unsupported,
        }
    }

    /// Register `driver` under `kind`.
    ///
    /// Fails with [`LimitError::DuplicateDriver`] if the kind is taken.
    pub fn register(&self, kind: K, driver: Arc<D>) -> Result<()>
    where
        K: fmt::Debug,
    {
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&kind) {
            debug!(kind = ?kind, "Driver already registered");
            return Err(LimitError::DuplicateDriver);
        }
        info!(kind = ?kind, "Driver registered");
        drivers.insert(kind, driver);
        Ok(())
    }

    /// Get the driver for `kind`, or the sentinel if none is registered.
    pub fn acquire(&self, kind: &K) -> Arc<D> {
        self.drivers
            .read()
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.unsupported.clone())
    }

    /// Whether a driver is registered under `kind`.
    pub fn contains(&self, kind: &K) -> bool {
        self.drivers.read().contains_key(kind)
    }

    /// Number of registered drivers, the sentinel excluded.
    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }

    /// The sentinel answered for unregistered kinds.
    pub fn unsupported(&self) -> &Arc<D> {
        &self.unsupported
    }
}

impl<K, D: ?Sized> fmt::Debug for DriverRegistry<K, D>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drivers = self.drivers.read();
        f.debug_struct("DriverRegistry")
            .field("kinds", &drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::{PeriodFailureLimit, PeriodLimit, PeriodOption};
    use crate::store::MemoryStore;

    struct AnotherPeriodLimitDriver;

    #[async_trait]
    impl PeriodLimitDriver for AnotherPeriodLimitDriver {
        async fn take(&self, _key: &str) -> Result<PeriodLimitState> {
            Ok(PeriodLimitState::Allowed)
        }

        async fn set_quota_full(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn del(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn get_run_value(&self, _key: &str) -> Result<RunValue> {
            Ok(RunValue::default())
        }
    }

    #[test]
    fn test_register_and_acquire() {
        let manager = PeriodLimitManager::<String>::new();
        let another: Arc<dyn PeriodLimitDriver> = Arc::new(AnotherPeriodLimitDriver);

        manager.register("another".to_string(), another.clone()).unwrap();
        assert!(manager.contains(&"another".to_string()));
        assert_eq!(manager.len(), 1);

        let driver = manager.acquire(&"another".to_string());
        assert!(Arc::ptr_eq(&driver, &another));
    }

    #[test]
    fn test_register_duplicate() {
        let manager = PeriodLimitManager::<&str>::new();
        let another: Arc<dyn PeriodLimitDriver> = Arc::new(AnotherPeriodLimitDriver);

        manager.register("another", another.clone()).unwrap();
        let err = manager.register("another", another).unwrap_err();
        assert!(matches!(err, LimitError::DuplicateDriver));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_unknown_returns_sentinel() {
        let manager = PeriodLimitManager::<String>::new();

        let first = manager.acquire(&"not found".to_string());
        let second = manager.acquire(&"also missing".to_string());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, manager.unsupported()));

        assert!(matches!(first.take("k").await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(first.set_quota_full("k").await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(first.del("k").await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(first.get_run_value("k").await, Err(LimitError::UnsupportedDriver)));
    }

    #[tokio::test]
    async fn test_failure_sentinel() {
        let manager = PeriodFailureLimitManager::<u32>::new();
        let driver = manager.acquire(&42);

        assert!(matches!(driver.check("k", true).await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(driver.check_err("k", None).await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(driver.set_quota_full("k").await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(driver.del("k").await, Err(LimitError::UnsupportedDriver)));
        assert!(matches!(driver.get_run_value("k").await, Err(LimitError::UnsupportedDriver)));
    }

    #[tokio::test]
    async fn test_with_drivers_routes_by_kind() {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        enum Tenant {
            Sms,
            Email,
            Push,
        }

        let store = Arc::new(MemoryStore::new());
        let sms: Arc<dyn PeriodLimitDriver> = Arc::new(PeriodLimit::new(
            store.clone(),
            [PeriodOption::KeyPrefix("sms".to_string()), PeriodOption::Quota(1)],
        ));
        let email: Arc<dyn PeriodLimitDriver> = Arc::new(PeriodLimit::new(
            store.clone(),
            [PeriodOption::KeyPrefix("email".to_string()), PeriodOption::Quota(2)],
        ));
        let manager = PeriodLimitManager::with_drivers([(Tenant::Sms, sms), (Tenant::Email, email)]);

        let state = manager.acquire(&Tenant::Sms).take("user").await.unwrap();
        assert!(state.is_hit_quota());
        let state = manager.acquire(&Tenant::Email).take("user").await.unwrap();
        assert!(state.is_allowed());
        assert!(manager.acquire(&Tenant::Push).take("user").await.is_err());

        assert_eq!(store.get("sms:user").unwrap(), Some(1));
        assert_eq!(store.get("email:user").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_failure_manager_with_limiter() {
        let store = Arc::new(MemoryStore::new());
        let manager = PeriodFailureLimitManager::new();
        manager
            .register(
                "login".to_string(),
                Arc::new(PeriodFailureLimit::new(store, [PeriodOption::Quota(1)])),
            )
            .unwrap();

        let driver = manager.acquire(&"login".to_string());
        assert!(driver.check("alice", false).await.unwrap().is_within_quota());
        assert!(driver.check("alice", false).await.unwrap().is_over_quota());
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let manager = Arc::new(PeriodLimitManager::<String>::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager
                        .register("shared".to_string(), Arc::new(AnotherPeriodLimitDriver))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(manager.len(), 1);
    }
}
