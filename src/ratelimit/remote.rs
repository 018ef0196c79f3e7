//! Rate limiter backed by a shared [`RemoteStore`].
//!
//! Every store call is bounded by a timeout and retried a fixed number of
//! times with backoff. When the store stays unreachable the configured
//! [`FailureMode`] decides the outcome.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::{BucketDecision, BucketState};
use super::counter::WindowDecision;
use super::identity::{CounterKey, Identity};
use super::limiter::{resolve_key, Decision, Strategy};
use super::rules::{Policy, PolicyTable};
use crate::config::StoreConfig;
use crate::error::{Result, TurnstileError};
use crate::store::{RemoteStore, StoreError};

/// Optimistic bucket updates give up after this many lost races.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Whether a store call may be sent again after an uncertain outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Reads; repeating them changes nothing
    Safe,
    /// Writes that may have landed before timing out
    Unsafe,
}

impl Replay {
    fn retries(self, err: &StoreError) -> bool {
        match err {
            StoreError::Unavailable(_) => true,
            StoreError::Timeout => self == Replay::Safe,
            StoreError::Corrupt(_) | StoreError::Contended => false,
        }
    }
}

/// What to decide when the state store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
    /// Return `StoreUnavailable` to the caller
    Error,
}

/// A rate limiter whose state lives in a [`RemoteStore`].
pub struct RemoteRateLimiter<S: RemoteStore> {
    policies: PolicyTable,
    store: Arc<S>,
    strategy: Strategy,
    settings: StoreConfig,
}

impl<S: RemoteStore> RemoteRateLimiter<S> {
    pub fn new(policies: PolicyTable, store: Arc<S>, strategy: Strategy, settings: StoreConfig) -> Self {
        Self {
            policies,
            store,
            strategy,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Resolve the policy for `identity` and count the request in the store.
    pub async fn check(&self, identity: &Identity, now: SystemTime) -> Result<Decision> {
        let (key, rule) = resolve_key(&self.policies, identity)?;
        let policy = &rule.policy;

        trace!(key = %key, strategy = ?self.strategy, "Checking remote rate limit");

        let outcome = match self.strategy {
            Strategy::FixedWindow => self
                .admit_window(&key, policy, now)
                .await
                .map(|window| Decision::from_window(key.clone(), policy, window)),
            Strategy::TokenBucket => self
                .admit_bucket(&key, policy, now)
                .await
                .map(|bucket| Decision::from_bucket(key.clone(), policy, bucket)),
        };

        match outcome {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(key = %decision.key, limit = decision.limit, "Rate limit exceeded");
                }
                Ok(decision)
            }
            Err(err) => self.on_store_failure(key, policy, now, err),
        }
    }

    async fn admit_window(&self, key: &CounterKey, policy: &Policy, now: SystemTime) -> std::result::Result<WindowDecision, StoreError> {
        let counted = self
            .with_retry("increment", Replay::Unsafe, || {
                self.store.increment(key.as_str(), policy.period, now)
            })
            .await?;

        Ok(WindowDecision {
            allowed: counted.count <= policy.limit,
            remaining: policy.limit.saturating_sub(counted.count),
            reset_at: counted.expires_at,
        })
    }

    async fn admit_bucket(
        &self,
        key: &CounterKey,
        policy: &Policy,
        now: SystemTime,
    ) -> std::result::Result<BucketDecision, StoreError> {
        let capacity = policy.capacity();
        let refill_rate = policy.refill_rate();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .with_retry("get", Replay::Safe, || self.store.get(key.as_str(), now))
                .await?;

            let mut state = match &current {
                Some(raw) => serde_json::from_str::<BucketState>(raw)
                    .map_err(|_| StoreError::Corrupt(key.to_string()))?,
                None => BucketState::new(capacity, refill_rate, now),
            };
            let decision = state.refill_and_take(capacity, refill_rate, now);

            let encoded = serde_json::to_string(&state)
                .map_err(|_| StoreError::Corrupt(key.to_string()))?;
            let swapped = self
                .with_retry("compare_and_swap", Replay::Unsafe, || {
                    self.store.compare_and_swap(
                        key.as_str(),
                        current.as_deref(),
                        encoded.clone(),
                        state.fill_time,
                        now,
                    )
                })
                .await?;

            if swapped {
                return Ok(decision);
            }
            trace!(key = %key, "Lost bucket update race, retrying");
        }

        Err(StoreError::Contended)
    }

    /// Run `op` with a timeout, retrying transient failures with backoff.
    ///
    /// A timed-out call may still have been applied by the store, so only
    /// [`Replay::Safe`] calls are retried after a timeout.
    async fn with_retry<T, F, Fut>(&self, op: &str, replay: Replay, mut call: F) -> std::result::Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.settings.timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };

            match result {
                Err(ref err) if attempt < self.settings.max_retries && replay.retries(err) => {
                    attempt += 1;
                    let backoff = self.settings.backoff(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                    debug!(op, attempt, backoff = ?backoff, "Retrying store call");
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                }
                other => return other,
            }
        }
    }

    fn on_store_failure(&self, key: CounterKey, policy: &Policy, now: SystemTime, err: StoreError) -> Result<Decision> {
        let allowed = match self.settings.failure_mode {
            FailureMode::Open => true,
            FailureMode::Closed => false,
            FailureMode::Error => {
                warn!(key = %key, error = %err, "State store unavailable");
                return Err(TurnstileError::StoreUnavailable(err.to_string()));
            }
        };

        warn!(
            key = %key,
            error = %err,
            failure_mode = ?self.settings.failure_mode,
            "State store unavailable, applying failure mode"
        );

        Ok(Decision {
            allowed,
            key,
            limit: policy.limit,
            remaining: if allowed { policy.limit } else { 0 },
            reset_at: now + policy.period,
            tokens_remaining: None,
            degraded: true,
        })
    }
}

#[async_trait]
impl<S: RemoteStore + 'static> RateLimiterBackend for RemoteRateLimiter<S> {
    async fn check(&self, identity: &Identity, now: SystemTime) -> Result<Decision> {
        RemoteRateLimiter::check(self, identity, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Counted, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::UNIX_EPOCH;
    use tokio_test::{assert_err, assert_ok};

    const POLICIES: &str = r#"
policies:
  - path: /api/critical
    requests_per_unit: 2
    unit: minute
  - pattern: /api/*
    requests_per_unit: 20
    unit: minute
"#;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn settings(failure_mode: FailureMode) -> StoreConfig {
        StoreConfig {
            timeout_ms: 20,
            max_retries: 2,
            backoff_ms: 1,
            failure_mode,
        }
    }

    fn limiter<S: RemoteStore>(store: Arc<S>, strategy: Strategy, failure_mode: FailureMode) -> RemoteRateLimiter<S> {
        RemoteRateLimiter::new(
            PolicyTable::from_yaml(POLICIES).unwrap(),
            store,
            strategy,
            settings(failure_mode),
        )
    }

    /// Fails the first `failures` calls, then delegates to a memory store.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        calls: AtomicU32,
        hang: bool,
    }

    impl FlakyStore {
        fn new(failures: u32, hang: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                hang,
            }
        }

        async fn fail(&self) -> std::result::Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures.store(left - 1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn increment(&self, key: &str, ttl: Duration, now: SystemTime) -> std::result::Result<Counted, StoreError> {
            self.fail().await?;
            self.inner.increment(key, ttl, now).await
        }

        async fn get(&self, key: &str, now: SystemTime) -> std::result::Result<Option<String>, StoreError> {
            self.fail().await?;
            self.inner.get(key, now).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            value: String,
            ttl: Duration,
            now: SystemTime,
        ) -> std::result::Result<bool, StoreError> {
            self.fail().await?;
            self.inner.compare_and_swap(key, expected, value, ttl, now).await
        }
    }

    #[tokio::test]
    async fn test_remote_window_scenario() {
        let limiter = limiter(Arc::new(MemoryStore::new()), Strategy::FixedWindow, FailureMode::Open);
        let identity = Identity::new("user1", "/api/critical");

        let decisions = [
            limiter.check(&identity, at(0)).await.unwrap(),
            limiter.check(&identity, at(10)).await.unwrap(),
            limiter.check(&identity, at(20)).await.unwrap(),
        ];

        assert_eq!(decisions.iter().map(|d| d.allowed).collect::<Vec<_>>(), [true, true, false]);
        assert_eq!(decisions.iter().map(|d| d.remaining).collect::<Vec<_>>(), [1, 0, 0]);
        assert_eq!(decisions[2].reset_at, at(60));
        assert!(!decisions[2].degraded);
    }

    #[tokio::test]
    async fn test_remote_bucket_round_trips_state() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), Strategy::TokenBucket, FailureMode::Open);
        let identity = Identity::new("user1", "/api/critical");

        assert!(limiter.check(&identity, at(0)).await.unwrap().allowed);
        assert!(limiter.check(&identity, at(0)).await.unwrap().allowed);
        assert!(!limiter.check(&identity, at(0)).await.unwrap().allowed);

        let raw = store.get("user1:/api/critical", at(0)).await.unwrap().unwrap();
        let state: BucketState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.tokens, 0.0);
        assert_eq!(state.fill_time, Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_remote_concurrent_checks() {
        let limiter = Arc::new(limiter(Arc::new(MemoryStore::new()), Strategy::FixedWindow, FailureMode::Open));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let identity = Identity::new("user1", "/api/critical");
                    limiter.check(&identity, at(0)).await
                })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| joined.as_ref().unwrap().as_ref().unwrap().allowed)
            .count();
        assert_eq!(allowed, 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2, false));
        let limiter = limiter(store.clone(), Strategy::FixedWindow, FailureMode::Closed);

        let decision = assert_ok!(limiter.check(&Identity::new("user1", "/api/critical"), at(0)).await);
        assert!(decision.allowed);
        assert!(!decision.degraded);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fail_open() {
        let store = Arc::new(FlakyStore::new(10, false));
        let limiter = limiter(store, Strategy::FixedWindow, FailureMode::Open);

        let decision = limiter.check(&Identity::new("user1", "/api/critical"), at(0)).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_fail_closed_on_timeout() {
        let store = Arc::new(FlakyStore::new(10, true));
        let limiter = limiter(store.clone(), Strategy::TokenBucket, FailureMode::Closed);

        let decision = limiter.check(&Identity::new("user1", "/api/other"), at(0)).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.headers().remaining, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_increment_timeout_is_not_replayed() {
        let store = Arc::new(FlakyStore::new(10, true));
        let limiter = limiter(store.clone(), Strategy::FixedWindow, FailureMode::Closed);

        let decision = limiter.check(&Identity::new("user1", "/api/critical"), at(0)).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replay_rules() {
        assert!(Replay::Safe.retries(&StoreError::Timeout));
        assert!(!Replay::Unsafe.retries(&StoreError::Timeout));
        assert!(Replay::Unsafe.retries(&StoreError::Unavailable("down".to_string())));
        assert!(!Replay::Safe.retries(&StoreError::Corrupt("k".to_string())));
        assert!(!Replay::Safe.retries(&StoreError::Contended));
    }

    #[tokio::test]
    async fn test_error_mode_surfaces_unavailable() {
        let store = Arc::new(FlakyStore::new(10, false));
        let limiter = limiter(store, Strategy::FixedWindow, FailureMode::Error);

        let err = assert_err!(limiter.check(&Identity::new("user1", "/api/critical"), at(0)).await);
        assert!(matches!(err, TurnstileError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_resolution_errors_skip_the_store() {
        let store = Arc::new(FlakyStore::new(0, false));
        let limiter = limiter(store.clone(), Strategy::FixedWindow, FailureMode::Open);

        let err = limiter.check(&Identity::new("user1", "/health"), at(0)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Unresolved { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }
}
