//! Fixed-window counters.

use dashmap::DashMap;
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::evictor::{grace_period, Evictable};
use super::identity::CounterKey;
use super::rules::Policy;

/// Counter state for one key.
///
/// `count` may exceed the limit to signal denial. `window_end` and
/// `last_seen` never move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    pub window_end: SystemTime,
    pub last_seen: SystemTime,
    pub period: Duration,
}

impl CounterState {
    fn new(now: SystemTime, period: Duration) -> Self {
        Self {
            count: 0,
            window_end: now + period,
            last_seen: now,
            period,
        }
    }

    fn is_idle(&self, now: SystemTime, grace_multiplier: u32) -> bool {
        let idle = now.duration_since(self.last_seen).unwrap_or(Duration::ZERO);
        now > self.window_end && idle > grace_period(self.period, grace_multiplier)
    }
}

/// Outcome of a fixed-window admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: SystemTime,
}

/// Fixed-window counters keyed by [`CounterKey`].
///
/// Each admission holds the key's shard guard for the whole
/// read-modify-write, so concurrent callers on one key are serialized.
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: DashMap<CounterKey, CounterState>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key` and decide whether it fits the policy.
    ///
    /// A window that has ended is restarted at `now`, not at the old
    /// boundary, so windows drift with traffic.
    pub fn admit(&self, key: &CounterKey, policy: &Policy, now: SystemTime) -> WindowDecision {
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, limit = policy.limit, period = ?policy.period, "Creating new rate limit counter");
                CounterState::new(now, policy.period)
            });
        let state = entry.value_mut();

        if now > state.window_end {
            debug!(key = %key, previous_count = state.count, "Window ended, resetting counter");
            state.count = 0;
            state.window_end = now + policy.period;
        }

        state.count = state.count.saturating_add(1);
        state.period = policy.period;
        if now > state.last_seen {
            state.last_seen = now;
        }

        WindowDecision {
            allowed: state.count <= policy.limit,
            remaining: policy.limit.saturating_sub(state.count),
            reset_at: state.window_end,
        }
    }

    /// Snapshot of the state for `key`.
    pub fn get(&self, key: &CounterKey) -> Option<CounterState> {
        self.counters.get(key).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn clear(&self) {
        self.counters.clear();
    }
}

impl Evictable for CounterStore {
    fn evict_idle(&self, now: SystemTime, grace_multiplier: u32) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, state| !state.is_idle(now, grace_multiplier));
        before.saturating_sub(self.counters.len())
    }

    fn tracked(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Selector;
    use std::sync::Arc;

    fn key(subject: &str) -> CounterKey {
        CounterKey::new(subject, &Selector::Path("/api/test".to_string()))
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    #[test]
    fn test_admits_up_to_limit() {
        let store = CounterStore::new();
        let policy = Policy::new(5, Duration::from_secs(60)).unwrap();

        for i in 0..5 {
            let decision = store.admit(&key("a"), &policy, at(0));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 4 - i);
            assert_eq!(decision.reset_at, at(60));
        }

        let decision = store.admit(&key("a"), &policy, at(1));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(store.get(&key("a")).unwrap().count, 6);
    }

    #[test]
    fn test_window_resets_from_now() {
        let store = CounterStore::new();
        let policy = Policy::new(2, Duration::from_secs(60)).unwrap();

        for _ in 0..3 {
            store.admit(&key("a"), &policy, at(0));
        }

        // Exactly at the boundary the old window still holds.
        assert!(!store.admit(&key("a"), &policy, at(60)).allowed);

        let decision = store.admit(&key("a"), &policy, at(75));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at, at(135));
        assert_eq!(store.get(&key("a")).unwrap().count, 1);
    }

    #[test]
    fn test_window_end_never_moves_backward() {
        let store = CounterStore::new();
        let policy = Policy::new(10, Duration::from_secs(60)).unwrap();

        store.admit(&key("a"), &policy, at(30));
        let decision = store.admit(&key("a"), &policy, at(10));
        assert_eq!(decision.reset_at, at(90));
        assert_eq!(store.get(&key("a")).unwrap().last_seen, at(30));
    }

    #[test]
    fn test_keys_are_independent() {
        let store = CounterStore::new();
        let policy = Policy::new(1, Duration::from_secs(60)).unwrap();

        assert!(store.admit(&key("a"), &policy, at(0)).allowed);
        assert!(store.admit(&key("b"), &policy, at(0)).allowed);
        assert!(!store.admit(&key("a"), &policy, at(0)).allowed);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_admissions_never_over_admit() {
        let store = Arc::new(CounterStore::new());
        let policy = Policy::new(5, Duration::from_secs(60)).unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                let policy = policy.clone();
                std::thread::spawn(move || store.admit(&key("shared"), &policy, at(0)).allowed)
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 5);
        assert_eq!(store.get(&key("shared")).unwrap().count, 100);
    }

    #[test]
    fn test_evict_idle_entries() {
        let store = CounterStore::new();
        let policy = Policy::new(5, Duration::from_secs(60)).unwrap();

        store.admit(&key("idle"), &policy, at(0));
        store.admit(&key("busy"), &policy, at(100));

        // 2 minutes of inactivity is not yet more than 2 periods.
        assert_eq!(store.evict_idle(at(120), 2), 0);

        assert_eq!(store.evict_idle(at(121), 2), 1);
        assert!(store.get(&key("idle")).is_none());
        assert!(store.get(&key("busy")).is_some());

        let decision = store.admit(&key("idle"), &policy, at(122));
        assert!(decision.allowed);
        assert_eq!(store.get(&key("idle")).unwrap().count, 1);
    }

    #[test]
    fn test_zero_grace_counts_as_one_period() {
        let store = CounterStore::new();
        let policy = Policy::new(5, Duration::from_secs(60)).unwrap();
        store.admit(&key("a"), &policy, at(0));

        assert_eq!(store.evict_idle(at(60), 0), 0);
        assert_eq!(store.evict_idle(at(61), 0), 1);
    }
}
