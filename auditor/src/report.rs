//! Read-side views of the store and their text renderings.

use anyhow::Result;
use audit_core::DAY_MS;
use audit_store::{Host, StoreTx, Vulnerability};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Hosts seen within this many days count as active.
pub const ACTIVE_DAYS: i64 = 2;

#[derive(Debug, Serialize)]
pub struct Report {
    pub vulnerabilities_count: usize,
    pub vulnerabilities: Vec<Vulnerability>,
    pub duplicate_keys_count: usize,
    pub duplicate_keys: BTreeMap<String, Vec<Host>>,
    pub active_hosts_count: usize,
    pub active_hosts: Vec<Host>,
}

pub fn build_report(tx: &StoreTx<'_>, now_ms: i64) -> Result<Report> {
    let vulnerabilities = tx.vulnerabilities()?;
    let duplicate_keys = tx.duplicate_keys()?;
    let active_hosts = tx.active_hosts(now_ms - ACTIVE_DAYS * DAY_MS)?;
    Ok(Report {
        vulnerabilities_count: vulnerabilities.len(),
        vulnerabilities,
        duplicate_keys_count: duplicate_keys.len(),
        duplicate_keys,
        active_hosts_count: active_hosts.len(),
        active_hosts,
    })
}

/// RFC 3339 rendering of a unix-ms timestamp; `never` for zero.
pub fn fmt_ms(ms: i64) -> String {
    if ms == 0 {
        return "never".into();
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

/// One tab-separated line per finding:
/// hostport, user, password, result, last tested, version.
pub fn write_vulnerabilities_tsv<W: Write>(w: &mut W, vulns: &[Vulnerability]) -> std::io::Result<()> {
    for v in vulns {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}\t{}",
            v.host.hostport,
            v.credential.user,
            v.credential.password,
            v.credential.result,
            fmt_ms(v.credential.last_tested),
            v.host.version
        )?;
    }
    Ok(())
}

pub fn write_hosts_csv<W: Write>(w: W, hosts: &[Host]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(w);
    for h in hosts {
        wtr.write_record([
            h.hostport.as_str(),
            h.version.as_str(),
            h.fingerprint.as_str(),
            fmt_ms(h.seen_first).as_str(),
            fmt_ms(h.seen_last).as_str(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_text<W: Write>(w: &mut W, report: &Report) -> std::io::Result<()> {
    writeln!(w, "Vulnerabilities: {}", report.vulnerabilities_count)?;
    for v in &report.vulnerabilities {
        writeln!(w)?;
        writeln!(w, "\tHost {}", v.host.hostport)?;
        writeln!(w, "\tVersion {}", v.host.version)?;
        writeln!(w, "\tUser {}", v.credential.user)?;
        writeln!(w, "\tPassword {}", v.credential.password)?;
        writeln!(w, "\tResult {}", v.credential.result)?;
        writeln!(w, "\tLast Tested {}", fmt_ms(v.credential.last_tested))?;
    }

    writeln!(w)?;
    writeln!(w, "Duplicate Keys: {}", report.duplicate_keys_count)?;
    for (fp, hosts) in &report.duplicate_keys {
        writeln!(w)?;
        writeln!(w, "{fp}:")?;
        for h in hosts {
            writeln!(w, "\tHost {}", h.hostport)?;
            writeln!(w, "\tVersion {}", h.version)?;
            writeln!(w, "\tSeen First {}", fmt_ms(h.seen_first))?;
            writeln!(w, "\tSeen Last {}", fmt_ms(h.seen_last))?;
        }
    }

    writeln!(w)?;
    writeln!(w, "Active Hosts: {}", report.active_hosts_count)?;
    for h in &report.active_hosts {
        writeln!(w, "\t{} {}", h.hostport, h.version)?;
    }
    Ok(())
}
