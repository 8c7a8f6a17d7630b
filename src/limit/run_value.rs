//! Counter snapshots read back from the store.

use std::time::Duration;

use crate::error::{LimitError, Result};

/// Raw TTL reported for a key that does not exist.
pub const TTL_MISSING: i64 = -2;
/// Raw TTL reported for a key that exists without an expiry.
pub const TTL_NO_EXPIRY: i64 = -1;

/// Remaining lifetime of a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    /// The key does not exist (raw `-2`)
    Missing,
    /// The key exists but never expires (raw `-1`)
    NoExpiry,
    /// The key expires after this many whole seconds
    Remaining(Duration),
}

impl Ttl {
    /// Convert from the raw wire value.
    pub fn from_raw(secs: i64) -> Self {
        match secs {
            TTL_MISSING => Ttl::Missing,
            TTL_NO_EXPIRY => Ttl::NoExpiry,
            // Anything else below -2 is not produced by a conforming store.
            n if n < 0 => Ttl::Missing,
            n => Ttl::Remaining(Duration::from_secs(n as u64)),
        }
    }

    /// Convert to the raw wire value.
    pub fn as_raw(&self) -> i64 {
        match self {
            Ttl::Missing => TTL_MISSING,
            Ttl::NoExpiry => TTL_NO_EXPIRY,
            Ttl::Remaining(d) => d.as_secs() as i64,
        }
    }

    /// Remaining lifetime, if the key has one.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Ttl::Remaining(d) => Some(*d),
            _ => None,
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::Remaining(Duration::ZERO)
    }
}

/// Snapshot of a counter key.
///
/// An absent key reads as `{ exist: false, count: 0, ttl: 0s }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunValue {
    /// `false` if the key does not exist
    pub exist: bool,
    /// Current count
    pub count: i64,
    /// Remaining lifetime
    pub ttl: Ttl,
}

impl RunValue {
    /// Decode the `[0]` / `[exists, count, ttl]` reply of a store.
    pub fn from_raw(raw: &[i64]) -> Result<Self> {
        match raw {
            [0] => Ok(RunValue::default()),
            [exists, count, ttl] => {
                let ttl = Ttl::from_raw(*ttl);
                Ok(RunValue {
                    // The key can expire between the read of the count and the TTL.
                    exist: *exists == 1 && ttl != Ttl::Missing,
                    count: *count,
                    ttl,
                })
            }
            _ => Err(LimitError::UnknownCode),
        }
    }
}
