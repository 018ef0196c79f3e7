//! Background removal of idle limiter state.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::EvictionConfig;

/// State that can drop entries nobody has touched for a while.
pub trait Evictable: Send + Sync {
    /// Remove entries idle for longer than `grace_multiplier` of their own
    /// period. Returns how many were removed.
    fn evict_idle(&self, now: SystemTime, grace_multiplier: u32) -> usize;

    /// Number of entries currently held.
    fn tracked(&self) -> usize;
}

/// Idle time after which an entry with the given period may be dropped.
/// A multiplier below 1 counts as 1.
pub(crate) fn grace_period(period: Duration, grace_multiplier: u32) -> Duration {
    period
        .checked_mul(grace_multiplier.max(1))
        .unwrap_or(Duration::MAX)
}

/// Periodic sweep over an [`Evictable`] store.
///
/// A removed key starts over with a full quota on its next request.
pub struct Evictor {
    target: Arc<dyn Evictable>,
    interval: Duration,
    grace_multiplier: u32,
}

impl Evictor {
    pub fn new(target: Arc<dyn Evictable>, config: &EvictionConfig) -> Self {
        Self {
            target,
            interval: config.interval(),
            grace_multiplier: config.grace_multiplier,
        }
    }

    /// Override the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run a single pass at `now`.
    pub fn sweep(&self, now: SystemTime) -> usize {
        let removed = self.target.evict_idle(now, self.grace_multiplier);
        if removed > 0 {
            debug!(
                removed,
                remaining = self.target.tracked(),
                "Evicted idle rate limit state"
            );
        }
        removed
    }

    /// Start sweeping on a timer until the returned handle is shut down.
    pub fn spawn(self) -> EvictorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval = ?self.interval,
            grace_multiplier = self.grace_multiplier,
            "Starting evictor"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(SystemTime::now());
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Evictor stopped");
        });

        EvictorHandle { shutdown_tx, task }
    }
}

/// Handle to a running evictor task.
pub struct EvictorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EvictorHandle {
    /// Stop the sweep loop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{CounterKey, CounterStore, Policy, Selector};

    fn key(subject: &str) -> CounterKey {
        CounterKey::new(subject, &Selector::Path("/api/test".to_string()))
    }

    fn config(grace_multiplier: u32) -> EvictionConfig {
        EvictionConfig {
            interval_secs: 1,
            grace_multiplier,
        }
    }

    #[test]
    fn test_sweep_uses_grace_multiplier() {
        let store = Arc::new(CounterStore::new());
        let policy = Policy::new(5, Duration::from_secs(60)).unwrap();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        store.admit(&key("a"), &policy, start);

        let evictor = Evictor::new(store.clone(), &config(3));
        assert_eq!(evictor.sweep(start + Duration::from_secs(150)), 0);
        assert_eq!(evictor.sweep(start + Duration::from_secs(181)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_grace_period_floor() {
        let minute = Duration::from_secs(60);
        assert_eq!(grace_period(minute, 0), minute);
        assert_eq!(grace_period(minute, 1), minute);
        assert_eq!(grace_period(minute, 3), Duration::from_secs(180));
        assert_eq!(grace_period(Duration::MAX, 2), Duration::MAX);
    }

    #[tokio::test]
    async fn test_background_sweep_and_shutdown() {
        let store = Arc::new(CounterStore::new());
        let policy = Policy::new(5, Duration::from_millis(1)).unwrap();
        let long_ago = SystemTime::now() - Duration::from_secs(600);

        store.admit(&key("a"), &policy, long_ago);
        store.admit(&key("b"), &policy, long_ago);
        assert_eq!(store.len(), 2);

        let handle = Evictor::new(store.clone(), &config(2))
            .with_interval(Duration::from_millis(10))
            .spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("evictor should stop promptly");
    }
}
