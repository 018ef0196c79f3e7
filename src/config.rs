//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{FailureMode, Strategy, SubjectSource};

/// Main configuration for the Turnstile engine and its demo front end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Engine configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Background eviction of idle state
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Remote state store access
    #[serde(default)]
    pub store: StoreConfig,

    /// How request metadata maps to an identity
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Where limiter state is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Per-key state owned by this process
    #[default]
    Local,
    /// State in a [`RemoteStore`](crate::store::RemoteStore), accessed
    /// under the `store` settings
    Remote,
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Where per-key state lives
    #[serde(default)]
    pub backend: Backend,

    /// Admission strategy applied to every resolved policy
    #[serde(default)]
    pub strategy: Strategy,

    /// Path to the policy table (YAML)
    pub policies_path: Option<String>,
}

/// Eviction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Seconds between sweeps
    #[serde(default = "default_eviction_interval")]
    pub interval_secs: u64,

    /// Idle entries are dropped after this many of their own periods
    #[serde(default = "default_grace_multiplier")]
    pub grace_multiplier: u32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_eviction_interval(),
            grace_multiplier: default_grace_multiplier(),
        }
    }
}

impl EvictionConfig {
    /// Time between two sweeps.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.grace_multiplier == 0 {
            return Err(TurnstileError::Config(
                "eviction.grace_multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_eviction_interval() -> u64 {
    30
}

fn default_grace_multiplier() -> u32 {
    2
}

/// Remote state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Per-call timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between attempts in milliseconds, doubled per retry
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    /// What to decide when the store stays unreachable
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff(),
            failure_mode: FailureMode::default(),
        }
    }
}

impl StoreConfig {
    /// Timeout applied to a single store call.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

fn default_store_timeout() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff() -> u64 {
    10
}

/// Identity extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Where the rate-limited subject comes from
    #[serde(default = "default_subject")]
    pub subject: SubjectSource,

    /// Header carrying the caller's role
    #[serde(default)]
    pub role_header: Option<String>,

    /// Role assumed when the role header is absent
    #[serde(default)]
    pub default_role: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            role_header: None,
            default_role: None,
        }
    }
}

fn default_subject() -> SubjectSource {
    SubjectSource::RemoteAddr
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TURNSTILE__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        self.eviction.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.limiter.strategy, Strategy::FixedWindow);
        assert_eq!(config.eviction.interval(), Duration::from_secs(30));
        assert_eq!(config.eviction.grace_multiplier, 2);
        assert_eq!(config.store.timeout(), Duration::from_millis(50));
        assert_eq!(config.store.failure_mode, FailureMode::Open);
        assert_eq!(config.identity.subject, SubjectSource::RemoteAddr);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limiter:
  strategy: token_bucket
  policies_path: config/policies.yaml
store:
  failure_mode: closed
identity:
  subject:
    from: header
    name: X-User-ID
  role_header: X-User-Role
  default_role: Free
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.strategy, Strategy::TokenBucket);
        assert_eq!(config.limiter.policies_path.as_deref(), Some("config/policies.yaml"));
        assert_eq!(config.store.failure_mode, FailureMode::Closed);
        assert_eq!(config.store.max_retries, 2);
        assert_eq!(config.eviction.grace_multiplier, 2);
        assert_eq!(
            config.identity.subject,
            SubjectSource::Header { name: "X-User-ID".to_string() }
        );
        assert_eq!(config.identity.default_role.as_deref(), Some("Free"));
    }

    #[test]
    fn test_backoff_doubles() {
        let store = StoreConfig {
            backoff_ms: 10,
            ..StoreConfig::default()
        };
        assert_eq!(store.backoff(1), Duration::from_millis(10));
        assert_eq!(store.backoff(2), Duration::from_millis(20));
        assert_eq!(store.backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn test_remote_backend() {
        let yaml = r#"
limiter:
  backend: remote
store:
  timeout_ms: 5
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.backend, Backend::Remote);
        assert_eq!(config.store.timeout(), Duration::from_millis(5));
        assert_eq!(TurnstileConfig::default().limiter.backend, Backend::Local);
    }

    #[test]
    fn test_rejects_zero_grace_multiplier() {
        let err = TurnstileConfig::from_yaml("eviction:\n  grace_multiplier: 0\n").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(TurnstileConfig::from_yaml("limiter: [").is_err());
    }
}
