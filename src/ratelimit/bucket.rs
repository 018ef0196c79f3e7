//! Continuously refilling token buckets.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::evictor::{grace_period, Evictable};
use super::identity::CounterKey;

/// Bucket state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Last time the bucket was refilled
    pub last_refill: SystemTime,
    /// Time to refill an empty bucket
    pub fill_time: Duration,
}

impl BucketState {
    pub fn new(capacity: f64, refill_rate: f64, now: SystemTime) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            fill_time: fill_time(capacity, refill_rate),
        }
    }

    /// Refill for the time elapsed since the last refill, then try to take
    /// one token. Fractional tokens carry over between calls.
    pub fn refill_and_take(&mut self, capacity: f64, refill_rate: f64, now: SystemTime) -> BucketDecision {
        let elapsed = now.duration_since(self.last_refill).unwrap_or(Duration::ZERO);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * refill_rate).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
        self.fill_time = fill_time(capacity, refill_rate);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }

        let missing = (capacity - self.tokens).max(0.0);
        let full_at = Duration::try_from_secs_f64(missing / refill_rate)
            .ok()
            .and_then(|wait| now.checked_add(wait))
            .unwrap_or(now);

        BucketDecision {
            allowed,
            tokens_remaining: self.tokens,
            full_at,
        }
    }

    fn is_idle(&self, now: SystemTime, grace_multiplier: u32) -> bool {
        let idle = now.duration_since(self.last_refill).unwrap_or(Duration::ZERO);
        idle > grace_period(self.fill_time, grace_multiplier)
    }
}

fn fill_time(capacity: f64, refill_rate: f64) -> Duration {
    if refill_rate > 0.0 {
        Duration::try_from_secs_f64(capacity / refill_rate).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}

/// Outcome of a token-bucket admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    pub tokens_remaining: f64,
    /// When the bucket will be full again if left alone
    pub full_at: SystemTime,
}

/// Token buckets keyed by [`CounterKey`].
#[derive(Debug, Default)]
pub struct TokenBucketStore {
    buckets: DashMap<CounterKey, BucketState>,
}

impl TokenBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill the bucket for `key` and take one token if available.
    pub fn admit(
        &self,
        key: &CounterKey,
        capacity: f64,
        refill_rate: f64,
        now: SystemTime,
    ) -> BucketDecision {
        let mut entry = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, capacity, refill_rate, "Creating new token bucket");
            BucketState::new(capacity, refill_rate, now)
        });
        entry.value_mut().refill_and_take(capacity, refill_rate, now)
    }

    /// Snapshot of the state for `key`.
    pub fn get(&self, key: &CounterKey) -> Option<BucketState> {
        self.buckets.get(key).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Evictable for TokenBucketStore {
    fn evict_idle(&self, now: SystemTime, grace_multiplier: u32) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| !state.is_idle(now, grace_multiplier));
        before.saturating_sub(self.buckets.len())
    }

    fn tracked(&self) -> usize {
        self.len()
    }
}
