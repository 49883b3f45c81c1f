//! One SSH login attempt per call, plus the host-key capture used by discovery.

use async_trait::async_trait;
use audit_core::{Credential, Finding};
use regex::Regex;
use std::time::Duration;

mod session;

pub use session::{fetch_fingerprint, SshAuthenticator};

/// Output some restricted shells print for any command after accepting any login.
pub const DEFAULT_FALSE_POSITIVE: &str = "Auth User/Pass with PS...fail...Please reconnect";

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("connect {hostport}: {source}")]
    Connect {
        hostport: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
    #[error("unusable private key: {0}")]
    Key(String),
}

impl AttemptError {
    /// Whether the error says something about the host rather than the credential.
    pub fn is_connectivity(&self) -> bool {
        !matches!(self, AttemptError::Key(_))
    }
}

/// Command output signatures that do not prove a working shell.
#[derive(Debug, Clone)]
pub struct FalsePositives(Vec<Regex>);

impl FalsePositives {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let res = patterns.iter().map(|p| Regex::new(p.as_ref())).collect::<Result<Vec<_>, _>>()?;
        Ok(FalsePositives(res))
    }

    pub fn matches(&self, output: &str) -> bool {
        self.0.iter().any(|re| re.is_match(output))
    }
}

impl Default for FalsePositives {
    fn default() -> Self {
        match Regex::new(&regex::escape(DEFAULT_FALSE_POSITIVE)) {
            Ok(re) => FalsePositives(vec![re]),
            Err(_) => FalsePositives(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub connect_timeout: Duration,
    /// Run after a successful login to prove a shell.
    pub exec_command: String,
    pub probe_user: String,
    pub probe_password: String,
    pub false_positives: FalsePositives,
}

impl Default for AuthOptions {
    fn default() -> Self {
        AuthOptions {
            connect_timeout: Duration::from_secs(4),
            exec_command: "id".into(),
            probe_user: "security".into(),
            probe_password: "security".into(),
            false_positives: FalsePositives::default(),
        }
    }
}

impl AuthOptions {
    /// Bound on everything after the TCP connect.
    pub fn session_deadline(&self) -> Duration {
        self.connect_timeout * 2
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub output: String,
}

/// A command proves a shell only if it exited 0 and printed nothing suspicious.
pub fn exec_confirms(out: Option<&ExecOutput>, false_positives: &FalsePositives) -> bool {
    match out {
        Some(o) => o.exit_status == Some(0) && !false_positives.matches(&o.output),
        None => false,
    }
}

/// Strongest confirmed capability wins.
pub fn classify(authenticated: bool, exec_confirmed: bool, tunnel_opened: bool) -> Finding {
    match (authenticated, exec_confirmed, tunnel_opened) {
        (false, _, _) => Finding::None,
        (true, true, _) => Finding::Exec,
        (true, false, true) => Finding::Tunnel,
        (true, false, false) => Finding::Auth,
    }
}

/// Performs a single credential test against one host.
///
/// A rejected login is `Ok(Finding::None)`; `Err` is reserved for attempts
/// that could not reach a verdict.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn attempt(&self, hostport: &str, cred: &Credential) -> Result<Finding, AttemptError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_precedence() {
        assert_eq!(classify(false, true, true), Finding::None);
        assert_eq!(classify(true, true, true), Finding::Exec);
        assert_eq!(classify(true, false, true), Finding::Tunnel);
        assert_eq!(classify(true, false, false), Finding::Auth);
    }

    #[test]
    fn exec_needs_clean_zero_exit() {
        let fp = FalsePositives::default();
        let ok = ExecOutput { exit_status: Some(0), output: "uid=1000(test) gid=1000(test)\n".into() };
        assert!(exec_confirms(Some(&ok), &fp));

        let failed = ExecOutput { exit_status: Some(127), output: "sh: id: not found".into() };
        assert!(!exec_confirms(Some(&failed), &fp));

        let missing = ExecOutput { exit_status: None, output: "uid=0(root)".into() };
        assert!(!exec_confirms(Some(&missing), &fp));

        let trap = ExecOutput {
            exit_status: Some(0),
            output: format!("\r\n{DEFAULT_FALSE_POSITIVE}\r\n"),
        };
        assert!(!exec_confirms(Some(&trap), &fp));
        assert!(!exec_confirms(None, &fp));
    }

    #[test]
    fn default_signature_is_literal() {
        let fp = FalsePositives::default();
        assert!(fp.matches("Auth User/Pass with PS...fail...Please reconnect"));
        assert!(!fp.matches("Auth User/Pass with PSxxxfailxxxPlease reconnect"));
    }

    #[test]
    fn custom_signatures() {
        let fp = FalsePositives::new(&["^Access denied", "honeypot"][..]).unwrap();
        assert!(fp.matches("Access denied for everyone"));
        assert!(fp.matches("welcome to the honeypot"));
        assert!(!fp.matches("uid=0(root)"));
        assert!(FalsePositives::new(&["("][..]).is_err());
    }

    #[test]
    fn key_errors_do_not_count_against_host() {
        assert!(!AttemptError::Key("bad".into()).is_connectivity());
        assert!(AttemptError::Timeout(Duration::from_secs(8)).is_connectivity());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(AttemptError::Connect { hostport: "h:22".into(), source: io }.is_connectivity());
    }
}
