//! Cross-checking hosts against a central log collector.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

/// Source of addresses that showed up in centralized auth logs.
pub trait LogSearcher {
    fn get_ips(&self) -> Result<Vec<String>>;
}

/// Reads addresses from a file, one per line. Blank lines and `#` comments
/// are ignored.
pub struct FileLogSearcher {
    path: PathBuf,
}

impl FileLogSearcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLogSearcher { path: path.into() }
    }
}

impl LogSearcher for FileLogSearcher {
    fn get_ips(&self) -> Result<Vec<String>> {
        let text = fs::read_to_string(&self.path).with_context(|| format!("read {}", self.path.display()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogcheckEntry {
    pub hostport: String,
    pub in_logs: bool,
}

/// Mark each active hostport by whether its address was found in the logs.
pub fn cross_reference(active: &[String], found: &[String]) -> Vec<LogcheckEntry> {
    let present: HashSet<&str> = found.iter().map(String::as_str).collect();
    active
        .iter()
        .filter_map(|hp| {
            let Some((ip, _)) = audit_core::split_hostport(hp) else {
                tracing::error!(host = %hp, "invalid hostport");
                return None;
            };
            Some(LogcheckEntry { hostport: hp.clone(), in_logs: present.contains(ip.as_str()) })
        })
        .collect()
}
