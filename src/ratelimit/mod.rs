//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod counter;
mod evictor;
mod identity;
mod limiter;
mod pattern;
mod remote;
mod rules;

pub use backend::{Engine, RateLimiterBackend};
pub use bucket::{BucketDecision, BucketState, TokenBucketStore};
pub use counter::{CounterState, CounterStore, WindowDecision};
pub use evictor::{Evictable, Evictor, EvictorHandle};
pub use identity::{
    CounterKey, ExtractIdentity, Identity, IdentityExtractor, RequestMeta, SubjectSource,
};
pub use limiter::{Decision, RateLimitHeaders, RateLimiter, Strategy};
pub use pattern::PathPattern;
pub use remote::{FailureMode, RemoteRateLimiter};
pub use rules::{Policy, PolicyTable, Rule, RuleConfig, Selector, TimeUnit};
