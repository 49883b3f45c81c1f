use crate::AuditOptions;
use anyhow::{Context, Result};
use serde::Deserialize;
use ssh_auth::{AuthOptions, FalsePositives, DEFAULT_FALSE_POSITIVE};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "ssh-auditor.yaml";
pub const DEFAULT_DB: &str = "ssh_db.sqlite";
pub const DEFAULT_PORTS: &str = "22";
pub const DEFAULT_DISCOVER_CONCURRENCY: usize = 256;
pub const DEFAULT_SCAN_CONCURRENCY: usize = 20;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DiscoverConfig {
    pub ports: Option<String>,
    pub concurrency: Option<usize>,
    pub banner_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScanConfig {
    pub concurrency: Option<usize>,
    pub max_failures: Option<usize>,
    pub queue_limit: Option<usize>,
    pub seen_window_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct SshConfig {
    pub connect_timeout_ms: Option<u64>,
    pub exec_command: Option<String>,
    pub probe_user: Option<String>,
    pub probe_password: Option<String>,
    /// Regexes; replaces the built-in list when set.
    pub false_positives: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub discover: Option<DiscoverConfig>,
    pub scan: Option<ScanConfig>,
    pub ssh: Option<SshConfig>,
    pub store: Option<StoreConfig>,
}

/// Load `path`, or `./ssh-auditor.yaml` if it exists. A file that exists but
/// does not parse is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}

impl Config {
    pub fn db_path(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.store.as_ref().and_then(|s| s.path.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB))
    }

    pub fn ports(&self, cli: Option<String>) -> String {
        cli.or_else(|| self.discover.as_ref().and_then(|d| d.ports.clone()))
            .unwrap_or_else(|| DEFAULT_PORTS.to_string())
    }

    pub fn discover_concurrency(&self, cli: Option<usize>) -> usize {
        cli.or_else(|| self.discover.as_ref().and_then(|d| d.concurrency))
            .unwrap_or(DEFAULT_DISCOVER_CONCURRENCY)
    }

    pub fn scan_concurrency(&self, cli: Option<usize>) -> usize {
        cli.or_else(|| self.scan.as_ref().and_then(|s| s.concurrency))
            .unwrap_or(DEFAULT_SCAN_CONCURRENCY)
    }

    pub fn auth_options(&self) -> Result<AuthOptions> {
        let mut opts = AuthOptions::default();
        let Some(ssh) = &self.ssh else { return Ok(opts) };
        if let Some(ms) = ssh.connect_timeout_ms { opts.connect_timeout = Duration::from_millis(ms); }
        if let Some(c) = &ssh.exec_command { opts.exec_command = c.clone(); }
        if let Some(u) = &ssh.probe_user { opts.probe_user = u.clone(); }
        if let Some(p) = &ssh.probe_password { opts.probe_password = p.clone(); }
        if let Some(patterns) = &ssh.false_positives {
            opts.false_positives = FalsePositives::new(patterns.as_slice()).context("ssh.false_positives")?;
        }
        Ok(opts)
    }

    pub fn audit_options(&self) -> Result<AuditOptions> {
        let mut opts = AuditOptions { auth: self.auth_options()?, ..AuditOptions::default() };
        if let Some(ms) = self.discover.as_ref().and_then(|d| d.banner_timeout_ms) {
            opts.banner_timeout = Duration::from_millis(ms);
        }
        if let Some(s) = &self.scan {
            if let Some(n) = s.max_failures { opts.max_failures = n; }
            if let Some(n) = s.queue_limit { opts.queue_limit = n; }
            if let Some(n) = s.seen_window_days { opts.seen_window_days = n; }
        }
        Ok(opts)
    }
}

/// Sample file contents, printed by `ssh-auditor config`.
pub fn sample_config() -> String {
    format!(
        r#"discover:
  ports: "{DEFAULT_PORTS}"
  concurrency: {DEFAULT_DISCOVER_CONCURRENCY}
  banner_timeout_ms: 2000
scan:
  concurrency: {DEFAULT_SCAN_CONCURRENCY}
  max_failures: 5
  queue_limit: 20000
  seen_window_days: 7
ssh:
  connect_timeout_ms: 4000
  exec_command: id
  probe_user: security
  probe_password: security
  false_positives:
    - "{}"
store:
  path: {DEFAULT_DB}
"#,
        regex_literal(DEFAULT_FALSE_POSITIVE)
    )
}

fn regex_literal(s: &str) -> String {
    s.replace('.', "\\\\.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.db_path(None), PathBuf::from(DEFAULT_DB));
        assert_eq!(cfg.ports(None), "22");
        let opts = cfg.audit_options().unwrap();
        assert_eq!(opts.max_failures, 5);
        assert_eq!(opts.queue_limit, 20_000);
        assert_eq!(opts.seen_window_days, 7);
        assert_eq!(opts.auth.connect_timeout, Duration::from_secs(4));
        assert_eq!(opts.banner_timeout, Duration::from_secs(2));
        assert_eq!(opts.banner_timeout, banners::DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(opts.auth.exec_command, "id");
    }

    #[test]
    fn file_values_apply_and_cli_wins() {
        let cfg = parse_config(
            "discover:\n  ports: \"22,2222\"\n  concurrency: 10\nscan:\n  max_failures: 2\nstore:\n  path: /tmp/a.sqlite\n",
        )
        .unwrap();
        assert_eq!(cfg.ports(None), "22,2222");
        assert_eq!(cfg.ports(Some("2200".into())), "2200");
        assert_eq!(cfg.discover_concurrency(None), 10);
        assert_eq!(cfg.discover_concurrency(Some(3)), 3);
        assert_eq!(cfg.scan_concurrency(None), DEFAULT_SCAN_CONCURRENCY);
        assert_eq!(cfg.db_path(None), PathBuf::from("/tmp/a.sqlite"));
        assert_eq!(cfg.audit_options().unwrap().max_failures, 2);
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(parse_config("scan: [unclosed").is_err());
        assert!(parse_config("scan:\n  max_failures: many\n").is_err());
        let bad_regex = parse_config("ssh:\n  false_positives: [\"(\"]\n").unwrap();
        assert!(bad_regex.auth_options().is_err());
    }

    #[test]
    fn sample_config_parses() {
        let cfg = parse_config(&sample_config()).unwrap();
        let opts = cfg.audit_options().unwrap();
        assert!(opts.auth.false_positives.matches(DEFAULT_FALSE_POSITIVE));
        assert!(!opts.auth.false_positives.matches("Auth User/Pass with PSxxxfail"));
    }
}
