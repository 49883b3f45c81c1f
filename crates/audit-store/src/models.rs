use audit_core::{Credential, Finding};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub hostport: String,
    pub version: String,
    pub fingerprint: String,
    pub seen_first: i64,
    pub seen_last: i64,
}

/// Test pairing of one host with one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCredential {
    pub hostport: String,
    pub user: String,
    pub password: String,
    /// Unix ms of the last attempt, 0 if never tested.
    pub last_tested: i64,
    pub result: Finding,
    pub scan_interval: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Fingerprint,
    Version,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Fingerprint => "fingerprint",
            ChangeKind::Version => "version",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "fingerprint" => Some(ChangeKind::Fingerprint),
            "version" => Some(ChangeKind::Version),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostChange {
    pub time: i64,
    pub hostport: String,
    pub kind: ChangeKind,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub host: Host,
    pub credential: HostCredential,
}

/// One host and the credentials due against it, in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub host: Host,
    pub credentials: Vec<Credential>,
}

/// What `reconcile` did with a discovered host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    New,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Discover,
    Scan,
    Rescan,
    Logcheck,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Discover => "discover",
            RunKind::Scan => "scan",
            RunKind::Rescan => "rescan",
            RunKind::Logcheck => "logcheck",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: i64,
    pub positive: i64,
    pub negative: i64,
    pub errors: i64,
}
