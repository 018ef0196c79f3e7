//! Core rate limiter implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::bucket::{BucketDecision, TokenBucketStore};
use super::counter::{CounterStore, WindowDecision};
use super::evictor::Evictable;
use super::identity::{CounterKey, Identity};
use super::rules::{Policy, PolicyTable, Rule};
use crate::error::{Result, TurnstileError};

/// How quota is tracked for every resolved policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Count requests in windows that restart when they expire
    #[default]
    FixedWindow,
    /// Take tokens from a continuously refilling bucket
    TokenBucket,
}

/// The outcome of a rate limit check.
///
/// Being over the limit is a normal outcome: `allowed` is `false` and the
/// quota fields still describe the caller's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// State key the request was counted against
    pub key: CounterKey,
    pub limit: u64,
    pub remaining: u64,
    /// When the quota is restored
    pub reset_at: SystemTime,
    /// Exact bucket level, for token-bucket policies
    pub tokens_remaining: Option<f64>,
    /// Set when the state store was unreachable and the failure mode decided
    pub degraded: bool,
}

/// Header values a transport should attach to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Reset time in seconds since the Unix epoch
    pub reset: u64,
}

impl Decision {
    pub(crate) fn from_window(key: CounterKey, policy: &Policy, window: WindowDecision) -> Self {
        Self {
            allowed: window.allowed,
            key,
            limit: policy.limit,
            remaining: window.remaining,
            reset_at: window.reset_at,
            tokens_remaining: None,
            degraded: false,
        }
    }

    pub(crate) fn from_bucket(key: CounterKey, policy: &Policy, bucket: BucketDecision) -> Self {
        Self {
            allowed: bucket.allowed,
            key,
            limit: policy.limit,
            remaining: bucket.tokens_remaining.floor() as u64,
            reset_at: bucket.full_at,
            tokens_remaining: Some(bucket.tokens_remaining),
            degraded: false,
        }
    }

    /// Whether the request went over its quota.
    pub fn is_rate_exceeded(&self) -> bool {
        !self.allowed
    }

    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self
                .reset_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs(),
        }
    }
}

enum StateStore {
    Window(CounterStore),
    Bucket(TokenBucketStore),
}

/// The in-process rate limiter.
///
/// Owns an immutable policy table and the per-key state for one strategy.
/// Safe to share across tasks behind an `Arc`.
pub struct RateLimiter {
    policies: PolicyTable,
    store: StateStore,
}

impl RateLimiter {
    pub fn new(policies: PolicyTable, strategy: Strategy) -> Self {
        let store = match strategy {
            Strategy::FixedWindow => StateStore::Window(CounterStore::new()),
            Strategy::TokenBucket => StateStore::Bucket(TokenBucketStore::new()),
        };
        Self { policies, store }
    }

    pub fn strategy(&self) -> Strategy {
        match self.store {
            StateStore::Window(_) => Strategy::FixedWindow,
            StateStore::Bucket(_) => Strategy::TokenBucket,
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Resolve the policy for `identity` and count the request against it.
    pub fn check(&self, identity: &Identity, now: SystemTime) -> Result<Decision> {
        let (key, rule) = resolve_key(&self.policies, identity)?;

        trace!(key = %key, "Checking rate limit");

        let decision = match &self.store {
            StateStore::Window(counters) => {
                let window = counters.admit(&key, &rule.policy, now);
                Decision::from_window(key, &rule.policy, window)
            }
            StateStore::Bucket(buckets) => {
                let bucket = buckets.admit(&key, rule.policy.capacity(), rule.policy.refill_rate(), now);
                Decision::from_bucket(key, &rule.policy, bucket)
            }
        };

        if !decision.allowed {
            debug!(key = %decision.key, limit = decision.limit, "Rate limit exceeded");
        }

        Ok(decision)
    }

    /// Number of keys with live state.
    pub fn tracked_keys(&self) -> usize {
        match &self.store {
            StateStore::Window(counters) => counters.len(),
            StateStore::Bucket(buckets) => buckets.len(),
        }
    }

    /// Drop all state.
    pub fn clear(&self) {
        match &self.store {
            StateStore::Window(counters) => counters.clear(),
            StateStore::Bucket(buckets) => buckets.clear(),
        }
    }
}

/// Validate the identity, resolve its rule and derive the state key.
pub(crate) fn resolve_key<'a>(policies: &'a PolicyTable, identity: &Identity) -> Result<(CounterKey, &'a Rule)> {
    if identity.subject.is_empty() {
        return Err(TurnstileError::MissingIdentity);
    }
    let rule = policies.resolve(identity)?;
    Ok((CounterKey::new(&identity.subject, &rule.selector), rule))
}

impl Evictable for RateLimiter {
    fn evict_idle(&self, now: SystemTime, grace_multiplier: u32) -> usize {
        match &self.store {
            StateStore::Window(counters) => counters.evict_idle(now, grace_multiplier),
            StateStore::Bucket(buckets) => buckets.evict_idle(now, grace_multiplier),
        }
    }

    fn tracked(&self) -> usize {
        self.tracked_keys()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(&self, identity: &Identity, now: SystemTime) -> Result<Decision> {
        RateLimiter::check(self, identity, now)
    }
}
