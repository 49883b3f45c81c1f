use crate::{ChangeKind, Host, HostChange, HostCredential, ScanRequest, StoreTx, Vulnerability};
use anyhow::{Context, Result};
use audit_core::{Credential, Finding, DAY_MS};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap};

const HOST_COLS: &str = "h.hostport, h.version, h.fingerprint, h.seen_first, h.seen_last";

fn host_row(r: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        hostport: r.get(0)?,
        version: r.get(1)?,
        fingerprint: r.get(2)?,
        seen_first: r.get(3)?,
        seen_last: r.get(4)?,
    })
}

fn finding_at(r: &Row<'_>, idx: usize) -> rusqlite::Result<Finding> {
    let s: String = r.get(idx)?;
    s.parse().map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// host_creds columns starting at `at`.
fn host_cred_row(r: &Row<'_>, at: usize) -> rusqlite::Result<HostCredential> {
    Ok(HostCredential {
        hostport: r.get(at)?,
        user: r.get(at + 1)?,
        password: r.get(at + 2)?,
        last_tested: r.get(at + 3)?,
        result: finding_at(r, at + 4)?,
        scan_interval: r.get(at + 5)?,
    })
}

/// Fold (host, credential) rows into per-host requests, keeping the order in
/// which each host first appears.
fn group_by_host(rows: Vec<(Host, Credential)>) -> Vec<ScanRequest> {
    let mut out: Vec<ScanRequest> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();
    for (host, cred) in rows {
        match slot.get(&host.hostport) {
            Some(&i) => out[i].credentials.push(cred),
            None => {
                slot.insert(host.hostport.clone(), out.len());
                out.push(ScanRequest { host, credentials: vec![cred] });
            }
        }
    }
    out
}

impl StoreTx<'_> {
    pub fn host(&self, hostport: &str) -> Result<Option<Host>> {
        let sql = format!("SELECT {HOST_COLS} FROM hosts h WHERE h.hostport=?");
        let h = self.tx.query_row(&sql, [hostport], host_row).optional().context("host")?;
        Ok(h)
    }

    pub fn all_hosts(&self) -> Result<Vec<Host>> {
        let sql = format!("SELECT {HOST_COLS} FROM hosts h ORDER BY h.hostport");
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map([], host_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn all_credentials(&self) -> Result<Vec<Credential>> {
        let mut stmt = self.tx.prepare("SELECT user, password, scan_interval FROM credentials ORDER BY user, password")?;
        let rows = stmt
            .query_map([], |r| Ok(Credential { user: r.get(0)?, password: r.get(1)?, scan_interval: r.get(2)? }))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn host_credentials(&self, hostport: &str) -> Result<Vec<HostCredential>> {
        let mut stmt = self.tx.prepare(
            "SELECT hostport, user, password, last_tested, result, scan_interval
             FROM host_creds WHERE hostport=? ORDER BY user, password",
        )?;
        let rows = stmt.query_map([hostport], |r| host_cred_row(r, 0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Identity changes, oldest first, optionally for a single host.
    pub fn host_changes(&self, hostport: Option<&str>) -> Result<Vec<HostChange>> {
        let mut stmt = self.tx.prepare(
            "SELECT time, hostport, type, old, new FROM host_changes
             WHERE ?1 IS NULL OR hostport=?1 ORDER BY time, rowid",
        )?;
        let rows = stmt
            .query_map([hostport], |r| {
                let kind: String = r.get(2)?;
                let kind = ChangeKind::parse(&kind).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, format!("change type {kind:?}").into())
                })?;
                Ok(HostChange { time: r.get(0)?, hostport: r.get(1)?, kind, old: r.get(3)?, new: r.get(4)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Pairings due for testing at `now_ms`, oldest `last_tested` first.
    ///
    /// Hosts without a fingerprint or not seen in the last `seen_window_days`
    /// are skipped.
    pub fn scan_queue(&self, now_ms: i64, seen_window_days: i64, limit: usize) -> Result<Vec<ScanRequest>> {
        let sql = format!(
            "SELECT {HOST_COLS}, hc.user, hc.password, hc.scan_interval
             FROM host_creds hc JOIN hosts h ON h.hostport = hc.hostport
             WHERE h.fingerprint != ''
               AND h.seen_last > ?1 - ?2 * {DAY_MS}
               AND hc.last_tested < ?1 - hc.scan_interval * {DAY_MS}
             ORDER BY hc.last_tested, hc.hostport
             LIMIT ?3"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now_ms, seen_window_days, limit as i64], |r| {
                Ok((host_row(r)?, Credential { user: r.get(5)?, password: r.get(6)?, scan_interval: r.get(7)? }))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("scan_queue")?;
        Ok(group_by_host(rows))
    }

    /// Rows `scan_queue` would return, ignoring the limit.
    pub fn scan_queue_size(&self, now_ms: i64, seen_window_days: i64) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(1) FROM host_creds hc JOIN hosts h ON h.hostport = hc.hostport
             WHERE h.fingerprint != ''
               AND h.seen_last > ?1 - ?2 * {DAY_MS}
               AND hc.last_tested < ?1 - hc.scan_interval * {DAY_MS}"
        );
        let n = self.tx.query_row(&sql, params![now_ms, seen_window_days], |r| r.get(0))?;
        Ok(n)
    }

    /// Previously positive pairings regardless of interval.
    pub fn rescan_queue(&self, limit: usize) -> Result<Vec<ScanRequest>> {
        let sql = format!(
            "SELECT {HOST_COLS}, hc.user, hc.password, hc.scan_interval
             FROM host_creds hc JOIN hosts h ON h.hostport = hc.hostport
             WHERE hc.result != ''
             ORDER BY hc.last_tested, hc.hostport
             LIMIT ?1"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map([limit as i64], |r| {
                Ok((host_row(r)?, Credential { user: r.get(5)?, password: r.get(6)?, scan_interval: r.get(7)? }))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("rescan_queue")?;
        Ok(group_by_host(rows))
    }

    /// Fingerprints shared by two or more hosts.
    pub fn duplicate_keys(&self) -> Result<BTreeMap<String, Vec<Host>>> {
        let sql = format!("SELECT {HOST_COLS} FROM hosts h WHERE h.fingerprint != '' ORDER BY h.fingerprint, h.hostport");
        let mut stmt = self.tx.prepare(&sql)?;
        let mut groups: BTreeMap<String, Vec<Host>> = BTreeMap::new();
        for h in stmt.query_map([], host_row)? {
            let h = h?;
            groups.entry(h.fingerprint.clone()).or_default().push(h);
        }
        groups.retain(|_, hosts| hosts.len() > 1);
        Ok(groups)
    }

    pub fn vulnerabilities(&self) -> Result<Vec<Vulnerability>> {
        let sql = format!(
            "SELECT {HOST_COLS}, hc.hostport, hc.user, hc.password, hc.last_tested, hc.result, hc.scan_interval
             FROM host_creds hc JOIN hosts h ON h.hostport = hc.hostport
             WHERE hc.result != ''
             ORDER BY hc.last_tested, h.hostport, hc.user"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map([], |r| Ok(Vulnerability { host: host_row(r)?, credential: host_cred_row(r, 5)? }))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("vulnerabilities")?;
        Ok(rows)
    }

    /// Hosts seen at or after `since_ms`.
    pub fn active_hosts(&self, since_ms: i64) -> Result<Vec<Host>> {
        let sql = format!("SELECT {HOST_COLS} FROM hosts h WHERE h.seen_last >= ? ORDER BY h.hostport");
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map([since_ms], host_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
