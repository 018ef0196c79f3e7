//! Rate limiter trait for abstracting local and remote-backed implementations.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

use super::evictor::Evictable;
use super::identity::{ExtractIdentity, Identity, RequestMeta};
use super::limiter::{Decision, RateLimiter};
use super::remote::RemoteRateLimiter;
use super::rules::PolicyTable;
use crate::config::{Backend, TurnstileConfig};
use crate::error::Result;
use crate::store::MemoryStore;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-process `RateLimiter` and the
/// `RemoteRateLimiter` so a transport can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check the rate limit for an already extracted identity at `now`.
    async fn check(&self, identity: &Identity, now: SystemTime) -> Result<Decision>;

    /// Extract the identity from request metadata, then check it.
    async fn check_request(
        &self,
        extractor: &dyn ExtractIdentity,
        request: &RequestMeta,
        now: SystemTime,
    ) -> Result<Decision> {
        let identity = extractor.extract(request)?;
        self.check(&identity, now).await
    }
}

/// A configured backend together with the state an evictor should sweep.
pub struct Engine {
    pub backend: Arc<dyn RateLimiterBackend>,
    pub state: Arc<dyn Evictable>,
}

impl Engine {
    /// Build the backend selected by `limiter.backend`.
    ///
    /// The remote backend talks to a [`MemoryStore`] under the `store`
    /// settings; its expired keys are left for the evictor.
    pub fn from_config(policies: PolicyTable, config: &TurnstileConfig) -> Self {
        let strategy = config.limiter.strategy;
        match config.limiter.backend {
            Backend::Local => {
                info!(strategy = ?strategy, "Using in-process rate limiter");
                let limiter = Arc::new(RateLimiter::new(policies, strategy));
                Self {
                    backend: limiter.clone(),
                    state: limiter,
                }
            }
            Backend::Remote => {
                info!(
                    strategy = ?strategy,
                    timeout_ms = config.store.timeout_ms,
                    max_retries = config.store.max_retries,
                    failure_mode = ?config.store.failure_mode,
                    "Using store-backed rate limiter"
                );
                let store = Arc::new(MemoryStore::new());
                let limiter = RemoteRateLimiter::new(policies, store.clone(), strategy, config.store.clone());
                Self {
                    backend: Arc::new(limiter),
                    state: store,
                }
            }
        }
    }
}
