//! Turnstile - Per-request Rate Limiting Engine
//!
//! This crate decides, for each incoming request, whether it fits the quota
//! configured for its resource or role. Policies resolve by exact path, by
//! role, then by the most specific wildcard pattern. Per-key state is kept
//! as fixed-window counters or token buckets, updated atomically per key and
//! swept by a background evictor once idle.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
