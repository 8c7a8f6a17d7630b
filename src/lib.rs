//! Quota Limiter - quota and rate limiting over a shared key-value store
//!
//! This crate answers per-key questions such as "has this caller made more
//! than N requests this period?", "has it failed M times in a row?" and "is
//! it within its token-bucket rate?" using single atomic store operations.
//! The token bucket keeps serving from a local limiter while the store is
//! unreachable.

pub mod config;
pub mod error;
pub mod limit;
pub mod store;
