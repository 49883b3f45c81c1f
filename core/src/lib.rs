//! Core types and concurrency primitives shared by the auditor crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub mod batch;
pub mod pipeline;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Current wall clock as unix epoch milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Outcome of one credential test, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Finding {
    #[default]
    None,
    Auth,
    Tunnel,
    Exec,
}

impl Finding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Finding::None => "",
            Finding::Auth => "auth",
            Finding::Tunnel => "tunnel",
            Finding::Exec => "exec",
        }
    }

    pub fn is_positive(&self) -> bool {
        *self != Finding::None
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown finding: {0:?}")]
pub struct UnknownFinding(pub String);

impl FromStr for Finding {
    type Err = UnknownFinding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Finding::None),
            "auth" => Ok(Finding::Auth),
            "tunnel" => Ok(Finding::Tunnel),
            "exec" => Ok(Finding::Exec),
            other => Err(UnknownFinding(other.to_string())),
        }
    }
}

impl From<Finding> for String {
    fn from(f: Finding) -> Self {
        f.as_str().to_string()
    }
}

impl TryFrom<String> for Finding {
    type Error = UnknownFinding;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A managed username/secret pair. `password` may hold a PEM private key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub password: String,
    /// Days between repeat tests of this pair against a host.
    pub scan_interval: i64,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>, scan_interval: i64) -> Self {
        Credential { user: user.into(), password: password.into(), scan_interval }
    }
}

/// A host as seen by one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHost {
    pub hostport: String,
    pub version: String,
    pub fingerprint: String,
}

/// One completed authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BruteForceResult {
    pub hostport: String,
    pub credential: Credential,
    pub finding: Finding,
    pub error: Option<String>,
}

/// Split `host:port` / `[v6]:port` into its parts.
pub fn split_hostport(hostport: &str) -> Option<(String, u16)> {
    let (host, port) = hostport.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() { return None; }
    Some((host.to_string(), port))
}
