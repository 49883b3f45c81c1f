use crate::{ChangeKind, Reconciled, RunKind, RunSummary, StoreTx};
use anyhow::{Context, Result};
use audit_core::{BruteForceResult, Credential, SshHost};
use rusqlite::params;
use uuid::Uuid;

impl StoreTx<'_> {
    /// Insert a credential or update its scan interval. Returns true if the
    /// pair was not known before.
    pub fn add_credential(&self, cred: &Credential) -> Result<bool> {
        let added = self.tx.execute(
            "INSERT OR IGNORE INTO credentials(user,password,scan_interval) VALUES (?,?,?)",
            params![cred.user, cred.password, cred.scan_interval],
        ).context("add_credential")?;
        self.tx.execute(
            "UPDATE credentials SET scan_interval=? WHERE user=? AND password=?",
            params![cred.scan_interval, cred.user, cred.password],
        ).context("add_credential")?;
        Ok(added == 1)
    }

    pub fn delete_credential(&self, user: &str, password: &str) -> Result<bool> {
        self.tx.execute("DELETE FROM host_creds WHERE user=? AND password=?", params![user, password])?;
        let n = self.tx.execute("DELETE FROM credentials WHERE user=? AND password=?", params![user, password])?;
        Ok(n > 0)
    }

    /// Fold one discovered host into the known-host table.
    ///
    /// An empty fingerprint or version from the probe keeps the stored value.
    /// A real difference is logged to `host_changes` and puts every pairing of
    /// the host back in the queue.
    pub fn reconcile(&self, host: &SshHost, at_ms: i64) -> Result<Reconciled> {
        let Some(known) = self.host(&host.hostport)? else {
            self.tx.execute(
                "INSERT INTO hosts(hostport,version,fingerprint,seen_first,seen_last) VALUES (?,?,?,?,?)",
                params![host.hostport, host.version, host.fingerprint, at_ms, at_ms],
            ).context("reconcile: insert host")?;
            return Ok(Reconciled::New);
        };

        let fingerprint = if host.fingerprint.is_empty() { &known.fingerprint } else { &host.fingerprint };
        let version = if host.version.is_empty() { &known.version } else { &host.version };

        let mut changed = false;
        if *fingerprint != known.fingerprint {
            self.add_host_change(&host.hostport, ChangeKind::Fingerprint, &known.fingerprint, fingerprint, at_ms)?;
            changed = true;
        }
        if *version != known.version {
            self.add_host_change(&host.hostport, ChangeKind::Version, &known.version, version, at_ms)?;
            changed = true;
        }

        if !changed {
            self.tx.execute("UPDATE hosts SET seen_last=? WHERE hostport=?", params![at_ms, host.hostport])
                .context("reconcile: touch host")?;
            return Ok(Reconciled::Unchanged);
        }
        self.tx.execute(
            "UPDATE hosts SET version=?, fingerprint=?, seen_last=? WHERE hostport=?",
            params![version, fingerprint, at_ms, host.hostport],
        ).context("reconcile: update host")?;
        self.reset_host_creds(&host.hostport)?;
        Ok(Reconciled::Changed)
    }

    fn add_host_change(&self, hostport: &str, kind: ChangeKind, old: &str, new: &str, at_ms: i64) -> Result<()> {
        self.tx.execute(
            "INSERT INTO host_changes(time,hostport,type,old,new) VALUES (?,?,?,?,?)",
            params![at_ms, hostport, kind.as_str(), old, new],
        ).context("add_host_change")?;
        Ok(())
    }

    fn reset_host_creds(&self, hostport: &str) -> Result<()> {
        self.tx.execute("UPDATE host_creds SET last_tested=0 WHERE hostport=?", params![hostport])
            .context("reset_host_creds")?;
        Ok(())
    }

    /// Create the missing host x credential pairings. Returns how many were added.
    pub fn materialize_queue(&self) -> Result<usize> {
        let n = self.tx.execute(
            "INSERT OR IGNORE INTO host_creds(hostport,user,password,last_tested,result,scan_interval)
             SELECT h.hostport, c.user, c.password, 0, '', c.scan_interval
             FROM hosts h CROSS JOIN credentials c",
            [],
        ).context("materialize_queue")?;
        Ok(n)
    }

    /// Persist one attempt. Failed attempts only move `last_tested`.
    pub fn record_result(&self, res: &BruteForceResult, at_ms: i64) -> Result<()> {
        let cred = &res.credential;
        if res.error.is_some() {
            self.tx.execute(
                "UPDATE host_creds SET last_tested=? WHERE hostport=? AND user=? AND password=?",
                params![at_ms, res.hostport, cred.user, cred.password],
            )
        } else {
            self.tx.execute(
                "UPDATE host_creds SET last_tested=?, result=? WHERE hostport=? AND user=? AND password=?",
                params![at_ms, res.finding.as_str(), res.hostport, cred.user, cred.password],
            )
        }
        .context("record_result")?;
        Ok(())
    }

    pub fn delete_host(&self, hostport: &str) -> Result<bool> {
        self.tx.execute("DELETE FROM host_creds WHERE hostport=?", params![hostport])?;
        let n = self.tx.execute("DELETE FROM hosts WHERE hostport=?", params![hostport])?;
        Ok(n > 0)
    }

    pub fn begin_run(&self, kind: RunKind, started_at: i64) -> Result<Uuid> {
        let run_id = Uuid::now_v7();
        self.tx.execute(
            "INSERT INTO runs(run_id, kind, started_at) VALUES (?,?,?)",
            params![run_id.to_string(), kind.as_str(), started_at],
        )?;
        Ok(run_id)
    }

    pub fn finish_run(&self, run_id: &Uuid, finished_at: i64, summary: &RunSummary) -> Result<()> {
        self.tx.execute(
            "UPDATE runs SET finished_at=?, total=?, positive=?, negative=?, errors=? WHERE run_id=?",
            params![finished_at, summary.total, summary.positive, summary.negative, summary.errors, run_id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Db, Reconciled};
    use audit_core::{BruteForceResult, Credential, Finding, SshHost, DAY_MS};

    fn host(hp: &str, version: &str, fp: &str) -> SshHost {
        SshHost { hostport: hp.into(), version: version.into(), fingerprint: fp.into() }
    }

    #[test]
    fn add_credential_reports_new_then_updates_interval() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        let cred = Credential::new("foo", "foo", 5);
        assert!(tx.add_credential(&cred).unwrap());
        assert_eq!(tx.all_credentials().unwrap(), vec![cred]);

        let cred = Credential::new("foo", "foo", 10);
        assert!(!tx.add_credential(&cred).unwrap());
        assert_eq!(tx.all_credentials().unwrap(), vec![cred]);
        tx.commit().unwrap();
    }

    #[test]
    fn rediscovery_only_moves_seen_last() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        let h = host("10.0.0.1:22", "SSH-2.0-OpenSSH_9.6", "SHA256:aaa");
        assert_eq!(tx.reconcile(&h, 1_000).unwrap(), Reconciled::New);
        assert_eq!(tx.reconcile(&h, 5_000).unwrap(), Reconciled::Unchanged);

        let stored = tx.host("10.0.0.1:22").unwrap().unwrap();
        assert_eq!(stored.seen_first, 1_000);
        assert_eq!(stored.seen_last, 5_000);
        assert!(tx.host_changes(None).unwrap().is_empty());
    }

    #[test]
    fn fingerprint_change_is_logged_and_requeues_host() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        tx.add_credential(&Credential::new("root", "root", 14)).unwrap();
        tx.add_credential(&Credential::new("test", "test", 14)).unwrap();
        tx.reconcile(&host("10.0.0.1:22", "SSH-2.0-A", "fp-old"), 1_000).unwrap();
        tx.reconcile(&host("10.0.0.2:22", "SSH-2.0-A", "fp-other"), 1_000).unwrap();
        assert_eq!(tx.materialize_queue().unwrap(), 4);

        for hp in ["10.0.0.1:22", "10.0.0.2:22"] {
            for (u, p) in [("root", "root"), ("test", "test")] {
                let res = BruteForceResult {
                    hostport: hp.into(),
                    credential: Credential::new(u, p, 14),
                    finding: Finding::None,
                    error: None,
                };
                tx.record_result(&res, 2_000).unwrap();
            }
        }

        let got = tx.reconcile(&host("10.0.0.1:22", "SSH-2.0-A", "fp-new"), 3_000).unwrap();
        assert_eq!(got, Reconciled::Changed);

        let changes = tx.host_changes(Some("10.0.0.1:22")).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, crate::ChangeKind::Fingerprint);
        assert_eq!(changes[0].old, "fp-old");
        assert_eq!(changes[0].new, "fp-new");

        assert!(tx.host_credentials("10.0.0.1:22").unwrap().iter().all(|hc| hc.last_tested == 0));
        assert!(tx.host_credentials("10.0.0.2:22").unwrap().iter().all(|hc| hc.last_tested == 2_000));
        let stored = tx.host("10.0.0.1:22").unwrap().unwrap();
        assert_eq!(stored.fingerprint, "fp-new");
        assert_eq!(stored.seen_last, 3_000);
    }

    #[test]
    fn empty_probe_values_keep_stored_identity() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        tx.reconcile(&host("10.0.0.1:22", "SSH-2.0-A", "fp"), 1_000).unwrap();
        assert_eq!(tx.reconcile(&host("10.0.0.1:22", "", ""), 2_000).unwrap(), Reconciled::Unchanged);
        let stored = tx.host("10.0.0.1:22").unwrap().unwrap();
        assert_eq!((stored.version.as_str(), stored.fingerprint.as_str()), ("SSH-2.0-A", "fp"));
    }

    #[test]
    fn version_and_fingerprint_change_log_two_rows() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        tx.reconcile(&host("h:22", "SSH-2.0-A", "fp1"), 1_000).unwrap();
        tx.reconcile(&host("h:22", "SSH-2.0-B", "fp2"), 2_000).unwrap();
        let kinds: Vec<_> = tx.host_changes(Some("h:22")).unwrap().into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![crate::ChangeKind::Fingerprint, crate::ChangeKind::Version]);
    }

    #[test]
    fn materialize_is_idempotent() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        tx.add_credential(&Credential::new("root", "toor", 3)).unwrap();
        tx.reconcile(&host("10.0.0.1:22", "v", "fp"), 1).unwrap();
        tx.reconcile(&host("10.0.0.2:22", "v", "fp"), 1).unwrap();
        assert_eq!(tx.materialize_queue().unwrap(), 2);
        assert_eq!(tx.materialize_queue().unwrap(), 0);

        tx.add_credential(&Credential::new("admin", "admin", 3)).unwrap();
        assert_eq!(tx.materialize_queue().unwrap(), 2);
        let hc = tx.host_credentials("10.0.0.1:22").unwrap();
        assert!(hc.iter().all(|c| c.scan_interval == 3 && c.last_tested == 0 && c.result == Finding::None));
    }

    #[test]
    fn pairing_keeps_interval_captured_at_creation() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        tx.add_credential(&Credential::new("root", "toor", 3)).unwrap();
        tx.reconcile(&host("10.0.0.1:22", "v", "fp"), 1).unwrap();
        tx.materialize_queue().unwrap();
        tx.add_credential(&Credential::new("root", "toor", 30)).unwrap();
        tx.materialize_queue().unwrap();
        assert_eq!(tx.host_credentials("10.0.0.1:22").unwrap()[0].scan_interval, 3);
    }

    #[test]
    fn failed_attempt_keeps_previous_finding() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        let cred = Credential::new("test", "test", 1);
        tx.add_credential(&cred).unwrap();
        tx.reconcile(&host("h:22", "v", "fp"), 1).unwrap();
        tx.materialize_queue().unwrap();

        let mut res = BruteForceResult { hostport: "h:22".into(), credential: cred, finding: Finding::Exec, error: None };
        tx.record_result(&res, 10 * DAY_MS).unwrap();
        res.finding = Finding::None;
        res.error = Some("connection reset".into());
        tx.record_result(&res, 11 * DAY_MS).unwrap();

        let hc = &tx.host_credentials("h:22").unwrap()[0];
        assert_eq!(hc.result, Finding::Exec);
        assert_eq!(hc.last_tested, 11 * DAY_MS);
    }

    #[test]
    fn deleting_a_host_drops_its_pairings() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        tx.add_credential(&Credential::new("a", "b", 1)).unwrap();
        tx.reconcile(&host("h:22", "v", "fp"), 1).unwrap();
        tx.materialize_queue().unwrap();
        assert!(tx.delete_host("h:22").unwrap());
        assert!(tx.host("h:22").unwrap().is_none());
        assert!(tx.host_credentials("h:22").unwrap().is_empty());
        assert!(!tx.delete_host("h:22").unwrap());
    }

    #[test]
    fn runs_are_recorded() {
        let mut db = Db::open_in_memory().unwrap();
        let tx = db.begin().unwrap();
        let id = tx.begin_run(crate::RunKind::Scan, 100).unwrap();
        let summary = crate::RunSummary { total: 3, positive: 1, negative: 1, errors: 1 };
        tx.finish_run(&id, 200, &summary).unwrap();
        let (kind, total): (String, i64) = tx.tx
            .query_row("SELECT kind, total FROM runs WHERE run_id=?", [id.to_string()], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!((kind.as_str(), total), ("scan", 3));
    }
}
