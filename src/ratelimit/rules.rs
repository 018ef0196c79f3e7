//! Rate limit policies and their resolution.
//!
//! A policy table is an ordered list of rules. Each rule selects requests by
//! an exact path, by caller role, or by a wildcard path pattern. Resolution
//! tries those three kinds in that order and the first hit wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, trace};

use super::identity::Identity;
use super::pattern::{self, PathPattern};
use crate::error::{Result, TurnstileError};

/// What a rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// An exact resource path
    Path(String),
    /// A caller role
    Role(String),
    /// A path pattern ending in `*`
    Pattern(PathPattern),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Path(path) => f.write_str(path),
            Selector::Role(role) => write!(f, "role:{}", role),
            Selector::Pattern(pattern) => write!(f, "{}", pattern),
        }
    }
}

/// A quota: at most `limit` requests per `period`.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub limit: u64,
    pub period: Duration,
    pub name: Option<String>,
}

impl Policy {
    pub fn new(limit: u64, period: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config("Policy limit must be positive".to_string()));
        }
        if period.is_zero() {
            return Err(TurnstileError::Config("Policy period must be positive".to_string()));
        }
        Ok(Self {
            limit,
            period,
            name: None,
        })
    }

    /// Bucket size when the policy runs as a token bucket.
    pub fn capacity(&self) -> f64 {
        self.limit as f64
    }

    /// Tokens added per second when the policy runs as a token bucket.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.period.as_secs_f64()
    }
}

/// A selector together with the policy it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub selector: Selector,
    pub policy: Policy,
}

/// Time unit for rule periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A rule as written in the policy file.
///
/// Exactly one of `path`, `role` or `pattern` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Number of requests allowed per period
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// How many units make up one period
    #[serde(default = "default_unit_count")]
    pub unit_count: u32,
    /// Optional name/description for this limit
    #[serde(default)]
    pub name: Option<String>,
}

fn default_unit_count() -> u32 {
    1
}

impl RuleConfig {
    fn into_rule(self) -> Result<Rule> {
        let selector = match (self.path, self.role, self.pattern) {
            (Some(path), None, None) => {
                if path.split('/').any(|s| s.contains('*')) {
                    return Err(TurnstileError::Config(format!(
                        "Path rule must not contain wildcards, use `pattern`: {}",
                        path
                    )));
                }
                Selector::Path(path)
            }
            (None, Some(role), None) => Selector::Role(role),
            (None, None, Some(pattern)) => {
                let parsed = PathPattern::parse(&pattern)?;
                if !parsed.is_wildcard() {
                    return Err(TurnstileError::Config(format!(
                        "Pattern rule must end in `*`, use `path` for exact matches: {}",
                        pattern
                    )));
                }
                Selector::Pattern(parsed)
            }
            _ => {
                return Err(TurnstileError::Config(
                    "Each rule needs exactly one of `path`, `role` or `pattern`".to_string(),
                ))
            }
        };

        let period = self.unit.duration() * self.unit_count;
        let mut policy = Policy::new(self.requests_per_unit, period)?;
        policy.name = self.name;

        Ok(Rule { selector, policy })
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<RuleConfig>,
}

/// Read-only table of rules, indexed by selector kind.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<Rule>,
    paths: HashMap<String, usize>,
    roles: HashMap<String, usize>,
    patterns: Vec<usize>,
}

impl PolicyTable {
    /// Build a table from rules in declaration order.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut table = PolicyTable::default();

        for rule in rules {
            let index = table.rules.len();
            let duplicate = match &rule.selector {
                Selector::Path(path) => table.paths.insert(path.clone(), index).is_some(),
                Selector::Role(role) => table.roles.insert(role.clone(), index).is_some(),
                Selector::Pattern(pattern) => {
                    let seen = table.patterns.iter().any(|&i| match &table.rules[i].selector {
                        Selector::Pattern(existing) => existing == pattern,
                        _ => false,
                    });
                    table.patterns.push(index);
                    seen
                }
            };
            if duplicate {
                return Err(TurnstileError::Config(format!(
                    "Duplicate rate limit rule for selector: {}",
                    rule.selector
                )));
            }
            table.rules.push(rule);
        }

        Ok(table)
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policies: {}", e)))?;

        let rules = file
            .policies
            .into_iter()
            .map(RuleConfig::into_rule)
            .collect::<Result<Vec<_>>>()?;

        Self::from_rules(rules)
    }

    /// All rules in declaration order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the rule that applies to `identity`.
    ///
    /// Exact path beats role, role beats pattern. Among patterns the most
    /// specific match wins and ties go to the one declared first.
    pub fn resolve(&self, identity: &Identity) -> Result<&Rule> {
        let resource = identity.resource.as_str();

        let found = self
            .paths
            .get(resource)
            .or_else(|| identity.role.as_ref().and_then(|role| self.roles.get(role)))
            .map(|&i| &self.rules[i])
            .or_else(|| self.match_pattern(resource));

        match found {
            Some(rule) => {
                trace!(resource = %resource, selector = %rule.selector, "Resolved rate limit rule");
                Ok(rule)
            }
            None => Err(TurnstileError::Unresolved {
                resource: resource.to_string(),
            }),
        }
    }

    fn match_pattern(&self, path: &str) -> Option<&Rule> {
        let candidates = self.patterns.iter().filter_map(|&i| {
            let rule = &self.rules[i];
            match &rule.selector {
                Selector::Pattern(pattern) => Some((pattern, rule)),
                _ => None,
            }
        });
        pattern::best_match(candidates, path)
    }
}
