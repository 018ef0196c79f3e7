//! Request identities and the keys derived from them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use crate::config::IdentityConfig;
use crate::error::{Result, TurnstileError};

use super::rules::Selector;

/// The composite used to select a policy and a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// The rate-limited principal (user id or client address)
    pub subject: String,
    /// The requested resource path
    pub resource: String,
    /// Optional role of the caller
    #[serde(default)]
    pub role: Option<String>,
}

impl Identity {
    /// Create an identity without a role.
    pub fn new(subject: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            resource: resource.into(),
            role: None,
        }
    }

    /// Attach a role to this identity.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Key of one piece of limiter state: the subject plus the selector that
/// matched, so every path under one wildcard shares a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey(String);

impl CounterKey {
    pub fn new(subject: &str, selector: &Selector) -> Self {
        Self(format!("{}:{}", subject, selector))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-agnostic view of an incoming request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Client address, when the transport knows it
    #[serde(default)]
    pub remote_addr: Option<IpAddr>,
    /// Request path
    pub path: String,
    /// Request headers; names are compared case-insensitively
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header value, ignoring case and treating empty values as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Where the subject of a request comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum SubjectSource {
    /// The client IP address
    RemoteAddr,
    /// A request header such as `X-User-ID`
    Header { name: String },
}

/// Turns request metadata into an [`Identity`].
pub trait ExtractIdentity: Send + Sync {
    fn extract(&self, request: &RequestMeta) -> Result<Identity>;
}

impl<F> ExtractIdentity for F
where
    F: Fn(&RequestMeta) -> Result<Identity> + Send + Sync,
{
    fn extract(&self, request: &RequestMeta) -> Result<Identity> {
        self(request)
    }
}

/// Configurable extractor covering the usual key derivations: by client
/// address, by user header, and optionally by role header.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    subject: SubjectSource,
    role_header: Option<String>,
    default_role: Option<String>,
}

impl IdentityExtractor {
    pub fn new(subject: SubjectSource) -> Self {
        Self {
            subject,
            role_header: None,
            default_role: None,
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self {
            subject: config.subject.clone(),
            role_header: config.role_header.clone(),
            default_role: config.default_role.clone(),
        }
    }

    /// Read the caller's role from `header`, falling back to `default_role`.
    pub fn with_role_header(mut self, header: impl Into<String>, default_role: Option<String>) -> Self {
        self.role_header = Some(header.into());
        self.default_role = default_role;
        self
    }
}

impl ExtractIdentity for IdentityExtractor {
    fn extract(&self, request: &RequestMeta) -> Result<Identity> {
        let subject = match &self.subject {
            SubjectSource::RemoteAddr => request.remote_addr.map(|addr| addr.to_string()),
            SubjectSource::Header { name } => request.header(name).map(str::to_string),
        }
        .ok_or(TurnstileError::MissingIdentity)?;

        let role = self.role_header.as_deref().and_then(|header| {
            request
                .header(header)
                .map(str::to_string)
                .or_else(|| self.default_role.clone())
        });

        Ok(Identity {
            subject,
            resource: request.path.clone(),
            role,
        })
    }
}
