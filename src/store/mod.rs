//! Shared state stores.
//!
//! When several processes must share quotas, limiter state lives in an
//! external key-value store. The engine reaches it only through the narrow
//! [`RemoteStore`] interface defined here.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Errors that can occur talking to a state store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store call timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value for key {0}")]
    Corrupt(String),
    #[error("too many concurrent updates")]
    Contended,
}

/// Result of an atomic counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counted {
    /// Value after the increment
    pub count: u64,
    /// When the key expires
    pub expires_at: SystemTime,
}

/// Minimal key-value interface a shared state store must offer.
///
/// Keys expire on their own; an expired key reads as absent.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Atomically increment the counter at `key`. A key created by this
    /// call expires `ttl` after `now`; an existing key keeps its expiry.
    ///
    /// Not idempotent: a call that times out may still have been applied,
    /// so callers must not resend it after a timeout.
    async fn increment(&self, key: &str, ttl: Duration, now: SystemTime) -> Result<Counted, StoreError>;

    /// Read the value stored at `key`.
    async fn get(&self, key: &str, now: SystemTime) -> Result<Option<String>, StoreError>;

    /// Store `value` at `key` only if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened. A
    /// mismatch leaves the store untouched.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, StoreError>;
}
