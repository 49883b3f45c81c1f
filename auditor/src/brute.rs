//! Credential brute-force stage.

use audit_core::pipeline::run_stage;
use audit_core::{BruteForceResult, Finding};
use audit_store::{RunSummary, ScanRequest};
use ssh_auth::Authenticator;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

const RESULT_BUFFER: usize = 1000;

/// Test every credential of every request, one host per worker at a time.
///
/// Once a host has produced more than `max_failures` connectivity errors the
/// rest of its credentials are skipped for this run and yield no result.
pub fn brute_force(
    requests: Receiver<ScanRequest>,
    auth: Arc<dyn Authenticator>,
    workers: usize,
    max_failures: usize,
) -> Receiver<BruteForceResult> {
    run_stage("brute", workers, RESULT_BUFFER, requests, move |req: ScanRequest, tx| {
        let auth = auth.clone();
        async move {
            let hostport = req.host.hostport;
            let total = req.credentials.len();
            let mut failures = 0usize;
            for (i, cred) in req.credentials.into_iter().enumerate() {
                if failures > max_failures {
                    warn!(host = %hostport, failures, skipped = total - i, "giving up on host for this run");
                    break;
                }
                let res = match auth.attempt(&hostport, &cred).await {
                    Ok(finding) => BruteForceResult { hostport: hostport.clone(), credential: cred, finding, error: None },
                    Err(e) => {
                        if e.is_connectivity() {
                            failures += 1;
                        }
                        BruteForceResult {
                            hostport: hostport.clone(),
                            credential: cred,
                            finding: Finding::None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                if tx.send(res).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Count one result into `summary` and log it.
pub fn tally(summary: &mut RunSummary, res: &BruteForceResult) {
    summary.total += 1;
    let user = res.credential.user.as_str();
    if let Some(err) = &res.error {
        summary.errors += 1;
        warn!(host = %res.hostport, user, error = %err, "brute force error");
    } else if res.finding.is_positive() {
        summary.positive += 1;
        info!(host = %res.hostport, user, result = %res.finding, "positive brute force result");
        debug!(host = %res.hostport, user, password = %res.credential.password, "positive credential");
    } else {
        summary.negative += 1;
        debug!(host = %res.hostport, user, "negative brute force result");
    }
}
