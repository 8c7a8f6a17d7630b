//! Configuration shared by the period limiters.

use std::time::Duration;

use chrono::{Local, Offset, Utc};

/// Default counting period: one day.
const DEFAULT_PERIOD_SECS: u64 = 24 * 60 * 60;
/// Default quota per period.
const DEFAULT_QUOTA: u64 = 6;
/// Stores count and expire in signed 64-bit seconds.
const MAX_PERIOD_SECS: u64 = i64::MAX as u64;
const MAX_QUOTA: u64 = i64::MAX as u64;

/// A named mutation of a [`PeriodLimitConfig`], applied in order at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodOption {
    /// Expire counters at the next local-timezone period boundary instead of
    /// `period` seconds after the first write.
    ///
    /// Limiting end users to five SMS codes a day needs the count to reset at
    /// local midnight, whatever time the first code went out.
    Align,
    /// Namespace for counter keys. A trailing `:` is added when missing.
    KeyPrefix(String),
    /// Counting period, truncated to whole seconds. Ignored below one second,
    /// capped at `i64::MAX` seconds.
    Period(Duration),
    /// Requests allowed per period. Ignored when zero, capped at `i64::MAX`.
    Quota(u64),
}

/// Immutable settings of a [`PeriodLimit`](super::PeriodLimit) or
/// [`PeriodFailureLimit`](super::PeriodFailureLimit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodLimitConfig {
    key_prefix: String,
    period: u64,
    quota: u64,
    align: bool,
}

impl PeriodLimitConfig {
    pub(crate) fn with_prefix(key_prefix: &str) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            period: DEFAULT_PERIOD_SECS,
            quota: DEFAULT_QUOTA,
            align: false,
        }
    }

    /// Build a configuration from the defaults and an ordered option list.
    pub(crate) fn build<I>(key_prefix: &str, opts: I) -> Self
    where
        I: IntoIterator<Item = PeriodOption>,
    {
        opts.into_iter()
            .fold(Self::with_prefix(key_prefix), |config, opt| config.apply(opt))
    }

    /// Apply one option.
    pub fn apply(mut self, opt: PeriodOption) -> Self {
        match opt {
            PeriodOption::Align => self.align = true,
            PeriodOption::KeyPrefix(mut prefix) => {
                if !prefix.ends_with(':') {
                    prefix.push(':');
                }
                self.key_prefix = prefix;
            }
            PeriodOption::Period(period) => {
                let secs = period.as_secs();
                if secs > 0 {
                    self.period = secs.min(MAX_PERIOD_SECS);
                }
            }
            PeriodOption::Quota(quota) => {
                if quota > 0 {
                    self.quota = quota.min(MAX_QUOTA);
                }
            }
        }
        self
    }

    /// Key prefix, always ending in `:`.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Counting period in whole seconds.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Quota per period.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Whether expiry is aligned to local period boundaries.
    pub fn is_align(&self) -> bool {
        self.align
    }

    pub(crate) fn format_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Expiry to use for a counter created now.
    pub fn expire_secs(&self) -> u64 {
        if !self.align {
            return self.period;
        }
        let offset = Local::now().offset().fix().local_minus_utc();
        aligned_expire_secs(self.period, Utc::now().timestamp(), i64::from(offset))
    }
}

/// Seconds from `unix_secs` to the next period boundary in a timezone that is
/// `utc_offset_secs` ahead of UTC. Always in `1..=period`.
pub(crate) fn aligned_expire_secs(period: u64, unix_secs: i64, utc_offset_secs: i64) -> u64 {
    let period = period.clamp(1, MAX_PERIOD_SECS) as i64;
    let local = unix_secs.saturating_add(utc_offset_secs);
    (period - local.rem_euclid(period)) as u64
}
