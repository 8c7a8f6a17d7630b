//! Quota and rate limiters and the driver registries that select them.

pub mod backend;
mod manager;
mod option;
mod period;
mod period_failure;
pub(crate) mod run_value;
mod token;

pub use backend::{PeriodFailureStore, PeriodStore, TokenStore};
pub use manager::{
    DriverRegistry, PeriodFailureLimitDriver, PeriodFailureLimitManager, PeriodLimitDriver,
    PeriodLimitManager, Unsupported, UnsupportedPeriodFailureLimitDriver,
    UnsupportedPeriodLimitDriver,
};
pub use option::{PeriodLimitConfig, PeriodOption};
pub use period::{PeriodLimit, PeriodLimitState, DEFAULT_PERIOD_KEY_PREFIX};
pub use period_failure::{
    PeriodFailureLimit, PeriodFailureLimitState, DEFAULT_PERIOD_FAILURE_KEY_PREFIX,
};
pub use run_value::{RunValue, Ttl, TTL_MISSING, TTL_NO_EXPIRY};
pub use token::{TokenLimit, TOKEN_PING_INTERVAL};
