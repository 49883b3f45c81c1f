use crate::brute::{brute_force, tally};
use crate::logcheck::{cross_reference, LogSearcher, LogcheckEntry};
use crate::report::{build_report, Report, ACTIVE_DAYS};
use anyhow::{Context, Result};
use audit_core::batch::batch;
use audit_core::pipeline::{feed, run_stage};
use audit_core::{now_ms, split_hostport, Credential, SshHost, DAY_MS};
use audit_store::{Db, Reconciled, RunKind, RunSummary, ScanRequest};
use banners::{probe_banner, BannerResult, DEFAULT_CONNECT_TIMEOUT};
use host_discovery::Targets;
use ssh_auth::{fetch_fingerprint, AuthOptions, Authenticator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CHANNEL_CAPACITY: usize = 1024;
const DISCOVER_BATCH: usize = 256;
const DISCOVER_FLUSH: Duration = Duration::from_secs(2);
const RESULT_BATCH: usize = 64;
const RESULT_FLUSH: Duration = Duration::from_secs(1);
/// Hosts seen within this many days get a logcheck probe.
const LOGCHECK_DAYS: i64 = 14;

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub auth: AuthOptions,
    pub banner_timeout: Duration,
    /// Connectivity errors tolerated per host per run.
    pub max_failures: usize,
    pub queue_limit: usize,
    pub seen_window_days: i64,
}

impl Default for AuditOptions {
    fn default() -> Self {
        AuditOptions {
            auth: AuthOptions::default(),
            banner_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_failures: 5,
            queue_limit: 20_000,
            seen_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoverRequest {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub ports: Vec<u16>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverSummary {
    pub total: usize,
    pub new: usize,
    pub changed: usize,
    /// Pairings added to the test queue afterwards.
    pub queued: usize,
}

pub struct Auditor {
    db: Db,
    auth: Arc<dyn Authenticator>,
    opts: AuditOptions,
}

impl Auditor {
    pub fn new(db: Db, auth: Arc<dyn Authenticator>, opts: AuditOptions) -> Self {
        Auditor { db, auth, opts }
    }

    pub fn db(&mut self) -> &mut Db {
        &mut self.db
    }

    /// Sweep the targets for SSH servers and fold what answers into the store.
    pub async fn discover(&mut self, req: &DiscoverRequest) -> Result<DiscoverSummary> {
        let targets = Targets::new(req.include.as_slice(), req.exclude.as_slice(), &req.ports)?;
        info!(
            include = %req.include.join(","),
            exclude = %req.exclude.join(","),
            ports = ?req.ports,
            total = targets.len(),
            "discovering hosts"
        );
        let run_id = {
            let tx = self.db.begin()?;
            let id = tx.begin_run(RunKind::Discover, now_ms())?;
            tx.commit()?;
            id
        };

        let hostports = feed(targets.into_hostports(), CHANNEL_CAPACITY);
        let banner_timeout = self.opts.banner_timeout;
        let banners = run_stage("banner", req.concurrency * 2, CHANNEL_CAPACITY, hostports, move |hp: String, tx| async move {
            let res = probe_banner(&hp, banner_timeout, banner_timeout).await;
            if res.success {
                let _ = tx.send(res).await;
            }
        });
        let auth_opts = Arc::new(self.opts.auth.clone());
        let hosts = run_stage("fingerprint", req.concurrency, CHANNEL_CAPACITY, banners, move |b: BannerResult, tx| {
            let opts = auth_opts.clone();
            async move {
                let fingerprint = fetch_fingerprint(&b.hostport, &opts).await;
                let _ = tx.send(SshHost { hostport: b.hostport, version: b.banner, fingerprint }).await;
            }
        });

        let mut batches = batch(hosts, DISCOVER_BATCH, DISCOVER_FLUSH, CancellationToken::new());
        let mut summary = DiscoverSummary::default();
        while let Some(chunk) = batches.recv().await {
            let at = now_ms();
            let tx = self.db.begin()?;
            for host in &chunk {
                let outcome = tx.reconcile(host, at).context("discover: reconcile batch")?;
                match outcome {
                    Reconciled::New => {
                        info!(host = %host.hostport, version = %host.version, fp = %host.fingerprint, "discovered new host");
                        summary.new += 1;
                    }
                    Reconciled::Changed => {
                        info!(host = %host.hostport, version = %host.version, fp = %host.fingerprint, "discovered changed host");
                        summary.changed += 1;
                    }
                    Reconciled::Unchanged => {}
                }
                summary.total += 1;
            }
            tx.commit().context("discover: commit batch")?;
        }
        info!(total = summary.total, new = summary.new, updated = summary.changed, "discovery report");

        summary.queued = self.update_queues()?;
        let tx = self.db.begin()?;
        let run = RunSummary { total: summary.total as i64, ..RunSummary::default() };
        tx.finish_run(&run_id, now_ms(), &run)?;
        tx.commit()?;
        Ok(summary)
    }

    /// Materialize missing pairings and log the queue size. Returns how many were added.
    pub fn update_queues(&mut self) -> Result<usize> {
        let tx = self.db.begin()?;
        let queued = tx.materialize_queue()?;
        let size = tx.scan_queue_size(now_ms(), self.opts.seen_window_days)?;
        tx.commit()?;
        info!(new = queued, total = size, "brute force queue size");
        Ok(queued)
    }

    pub async fn scan(&mut self, concurrency: usize) -> Result<RunSummary> {
        self.brute(RunKind::Scan, concurrency).await
    }

    pub async fn rescan(&mut self, concurrency: usize) -> Result<RunSummary> {
        self.brute(RunKind::Rescan, concurrency).await
    }

    async fn brute(&mut self, kind: RunKind, concurrency: usize) -> Result<RunSummary> {
        self.update_queues()?;
        let (queue, run_id) = {
            let now = now_ms();
            let tx = self.db.begin()?;
            let queue = match kind {
                RunKind::Rescan => tx.rescan_queue(self.opts.queue_limit),
                _ => tx.scan_queue(now, self.opts.seen_window_days, self.opts.queue_limit),
            }
            .context("error getting scan queue")?;
            let run_id = tx.begin_run(kind, now)?;
            tx.commit()?;
            (queue, run_id)
        };
        info!(kind = kind.as_str(), hosts = queue.len(), "starting brute force");

        let results = brute_force(feed(queue, CHANNEL_CAPACITY), self.auth.clone(), concurrency, self.opts.max_failures);
        let mut batches = batch(results, RESULT_BATCH, RESULT_FLUSH, CancellationToken::new());
        let mut summary = RunSummary::default();
        while let Some(chunk) = batches.recv().await {
            let at = now_ms();
            let tx = self.db.begin()?;
            for res in &chunk {
                tally(&mut summary, res);
                tx.record_result(res, at).context("brute: record result")?;
            }
            tx.commit().context("brute: commit batch")?;
        }

        let tx = self.db.begin()?;
        tx.finish_run(&run_id, now_ms(), &summary)?;
        tx.commit()?;
        info!(
            total = summary.total,
            neg = summary.negative,
            pos = summary.positive,
            err = summary.errors,
            "brute force scan report"
        );
        Ok(summary)
    }

    /// Send one deliberately failing login to every recently seen host, so
    /// their log shipping can be checked with [`Auditor::logcheck_report`].
    pub async fn logcheck_run(&mut self, concurrency: usize) -> Result<RunSummary> {
        let now = now_ms();
        let (hosts, run_id) = {
            let tx = self.db.begin()?;
            let hosts = tx.active_hosts(now - LOGCHECK_DAYS * DAY_MS)?;
            let run_id = tx.begin_run(RunKind::Logcheck, now)?;
            tx.commit()?;
            (hosts, run_id)
        };
        let queue: Vec<ScanRequest> = hosts
            .into_iter()
            .filter_map(|host| {
                let (ip, _) = split_hostport(&host.hostport)?;
                let cred = Credential::new(format!("logcheck-{ip}"), "logcheck", 0);
                Some(ScanRequest { host, credentials: vec![cred] })
            })
            .collect();

        let mut results = brute_force(feed(queue, CHANNEL_CAPACITY), self.auth.clone(), concurrency, self.opts.max_failures);
        let mut summary = RunSummary::default();
        while let Some(res) = results.recv().await {
            summary.total += 1;
            match &res.error {
                Some(e) => {
                    summary.errors += 1;
                    error!(host = %res.hostport, user = %res.credential.user, error = %e, "failed to send logcheck auth request");
                }
                None => {
                    summary.negative += 1;
                    info!(host = %res.hostport, user = %res.credential.user, "sent logcheck auth request");
                }
            }
        }

        let tx = self.db.begin()?;
        tx.finish_run(&run_id, now_ms(), &summary)?;
        tx.commit()?;
        Ok(summary)
    }

    /// Which active hosts have been seen by the log collector.
    pub fn logcheck_report(&mut self, searcher: &dyn LogSearcher) -> Result<Vec<LogcheckEntry>> {
        let active = {
            let tx = self.db.begin()?;
            let hosts = tx.active_hosts(now_ms() - ACTIVE_DAYS * DAY_MS).context("logcheck report: active hosts")?;
            hosts
        };
        let found = searcher.get_ips().context("logcheck report: search logs")?;
        info!(count = active.len(), "found active hosts in store");
        info!(count = found.len(), "found related hosts in logs");
        let hostports: Vec<String> = active.into_iter().map(|h| h.hostport).collect();
        Ok(cross_reference(&hostports, &found))
    }

    pub fn report(&mut self) -> Result<Report> {
        let tx = self.db.begin()?;
        build_report(&tx, now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use audit_core::Finding;
    use ssh_auth::AttemptError;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Accepts only test/test, as exec.
    #[derive(Default)]
    struct WeakHost {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Authenticator for WeakHost {
        async fn attempt(&self, hostport: &str, cred: &Credential) -> Result<Finding, AttemptError> {
            self.seen.lock().unwrap().push((hostport.to_string(), cred.user.clone()));
            if cred.user == "test" && cred.password == "test" {
                Ok(Finding::Exec)
            } else {
                Ok(Finding::None)
            }
        }
    }

    fn auditor_with(auth: Arc<WeakHost>) -> Auditor {
        let opts = AuditOptions {
            auth: AuthOptions { connect_timeout: Duration::from_millis(500), ..AuthOptions::default() },
            banner_timeout: Duration::from_millis(500),
            ..AuditOptions::default()
        };
        Auditor::new(Db::open_in_memory().unwrap(), auth, opts)
    }

    fn seed_host(a: &mut Auditor, hp: &str, fp: &str) {
        let tx = a.db().begin().unwrap();
        let h = SshHost { hostport: hp.into(), version: "SSH-2.0-test".into(), fingerprint: fp.into() };
        tx.reconcile(&h, now_ms()).unwrap();
        tx.commit().unwrap();
    }

    fn add_creds(a: &mut Auditor, creds: &[(&str, &str)]) {
        let tx = a.db().begin().unwrap();
        for (u, p) in creds {
            tx.add_credential(&Credential::new(*u, *p, 14)).unwrap();
        }
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn scan_records_findings_then_queue_is_empty() {
        let auth = Arc::new(WeakHost::default());
        let mut a = auditor_with(auth.clone());
        seed_host(&mut a, "10.0.0.1:22", "fp1");
        seed_host(&mut a, "10.0.0.2:22", "");
        add_creds(&mut a, &[("root", "root"), ("test", "test")]);

        let summary = a.scan(4).await.unwrap();
        assert_eq!(summary, RunSummary { total: 2, positive: 1, negative: 1, errors: 0 });
        assert!(auth.seen.lock().unwrap().iter().all(|(h, _)| h == "10.0.0.1:22"));

        let again = a.scan(4).await.unwrap();
        assert_eq!(again.total, 0);

        let report = a.report().unwrap();
        assert_eq!(report.vulnerabilities_count, 1);
        assert_eq!(report.vulnerabilities[0].credential.user, "test");
    }

    #[tokio::test]
    async fn rescan_only_retests_findings() {
        let auth = Arc::new(WeakHost::default());
        let mut a = auditor_with(auth.clone());
        seed_host(&mut a, "10.0.0.1:22", "fp1");
        add_creds(&mut a, &[("root", "root"), ("test", "test")]);
        a.scan(2).await.unwrap();
        auth.seen.lock().unwrap().clear();

        let summary = a.rescan(2).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.positive, 1);
        assert_eq!(*auth.seen.lock().unwrap(), vec![("10.0.0.1:22".to_string(), "test".to_string())]);
    }

    #[tokio::test]
    async fn logcheck_uses_synthetic_user_and_stores_nothing() {
        let auth = Arc::new(WeakHost::default());
        let mut a = auditor_with(auth.clone());
        seed_host(&mut a, "10.0.0.7:22", "fp");
        let summary = a.logcheck_run(2).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(*auth.seen.lock().unwrap(), vec![("10.0.0.7:22".to_string(), "logcheck-10.0.0.7".to_string())]);
        let tx = a.db().begin().unwrap();
        assert!(tx.host_credentials("10.0.0.7:22").unwrap().is_empty());
    }

    struct Fixed(Vec<String>);

    impl LogSearcher for Fixed {
        fn get_ips(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn logcheck_report_flags_hosts_in_logs() {
        let mut a = auditor_with(Arc::new(WeakHost::default()));
        seed_host(&mut a, "10.0.0.1:22", "fp1");
        seed_host(&mut a, "10.0.0.2:22", "fp2");
        let got = a.logcheck_report(&Fixed(vec!["10.0.0.2".into()])).unwrap();
        let flags: Vec<_> = got.iter().map(|e| (e.hostport.as_str(), e.in_logs)).collect();
        assert_eq!(flags, vec![("10.0.0.1:22", false), ("10.0.0.2:22", true)]);
    }

    #[tokio::test]
    async fn discover_finds_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = sock.write_all(b"SSH-2.0-FakeServer_1.0\r\n").await;
                });
            }
        });

        let mut a = auditor_with(Arc::new(WeakHost::default()));
        add_creds(&mut a, &[("root", "root")]);
        let req = DiscoverRequest {
            include: vec!["127.0.0.1".into()],
            exclude: vec![],
            ports: vec![port],
            concurrency: 2,
        };
        let summary = a.discover(&req).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.new, 1);
        assert_eq!(summary.queued, 1);

        let hp = format!("127.0.0.1:{port}");
        let tx = a.db().begin().unwrap();
        let host = tx.host(&hp).unwrap().unwrap();
        assert_eq!(host.version, "SSH-2.0-FakeServer_1.0");
        assert_eq!(host.fingerprint, "");
        drop(tx);

        let again = a.discover(&req).await.unwrap();
        assert_eq!((again.total, again.new, again.changed), (1, 0, 0));
    }

    #[tokio::test]
    async fn bad_range_aborts_discovery() {
        let mut a = auditor_with(Arc::new(WeakHost::default()));
        let req = DiscoverRequest {
            include: vec!["10.0.0.0/33".into()],
            exclude: vec![],
            ports: vec![22],
            concurrency: 1,
        };
        assert!(a.discover(&req).await.is_err());
    }
}
