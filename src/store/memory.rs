//! In-process [`RemoteStore`] with per-key expiry.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::{Counted, RemoteStore, StoreError};
use crate::ratelimit::Evictable;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: SystemTime,
}

impl Entry {
    fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

/// A store living in this process, with the same semantics a networked
/// store is expected to provide. Useful as a single-node backend and as a
/// stand-in for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self, now: SystemTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired store keys");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration, now: SystemTime) -> Result<Counted, StoreError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: now + ttl,
        });

        if !entry.is_live(now) {
            entry.value = "0".to_string();
            entry.expires_at = now + ttl;
        }

        let current: u64 = entry
            .value
            .parse()
            .map_err(|_| StoreError::Corrupt(key.to_string()))?;
        let count = current.saturating_add(1);
        entry.value = count.to_string();

        Ok(Counted {
            count,
            expires_at: entry.expires_at,
        })
    }

    async fn get(&self, key: &str, now: SystemTime) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, StoreError> {
        let fresh = Entry {
            value,
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Slot::Occupied(mut slot) => {
                let live = slot.get().is_live(now);
                let current = live.then(|| slot.get().value.as_str());
                if current != expected {
                    if !live {
                        slot.remove();
                    }
                    return Ok(false);
                }
                slot.insert(fresh);
                Ok(true)
            }
            Slot::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                slot.insert(fresh);
                Ok(true)
            }
        }
    }
}

impl Evictable for MemoryStore {
    /// Keys carry their own TTL, so the grace multiplier does not apply.
    fn evict_idle(&self, now: SystemTime, _grace_multiplier: u32) -> usize {
        self.purge_expired(now)
    }

    fn tracked(&self) -> usize {
        self.len()
    }
}
