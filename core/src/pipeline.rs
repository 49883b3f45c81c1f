//! Bounded worker-pool stages connected by channels.
//!
//! A stage drains its input with `workers + 1` tasks and owns the only
//! senders of its output. The output closes once every worker has returned,
//! so a consumer that reads until `None` has seen all upstream work.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Push every item into a bounded channel from a background task.
pub fn feed<I, T>(items: I, capacity: usize) -> Receiver<T>
where
    I: IntoIterator<Item = T> + Send + 'static,
    I::IntoIter: Send,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() { break; }
        }
    });
    rx
}

/// Run `work` over every input item on a pool of workers.
///
/// `work` receives its own sender and may emit any number of outputs per
/// input. Sends block while the output buffer is full, which stalls the
/// worker and in turn its upstream.
pub fn run_stage<I, O, F, Fut>(
    name: &'static str,
    workers: usize,
    capacity: usize,
    input: Receiver<I>,
    work: F,
) -> Receiver<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, Sender<O>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let input = Arc::new(Mutex::new(input));
    let work = Arc::new(work);

    let mut pool = JoinSet::new();
    for _ in 0..=workers {
        let input = input.clone();
        let work = work.clone();
        let tx = tx.clone();
        pool.spawn(async move {
            loop {
                let next = input.lock().await.recv().await;
                let Some(item) = next else { break };
                work(item, tx.clone()).await;
            }
        });
    }

    tokio::spawn(async move {
        let mut finished = 0usize;
        while let Some(res) = pool.join_next().await {
            if let Err(e) = res {
                error!(stage = name, error = %e, "stage worker failed");
            }
            finished += 1;
        }
        debug!(stage = name, workers = finished, "stage drained");
        // Last sender; the output closes here.
        drop(tx);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_item_is_processed_before_close() {
        let input = feed(1..=500u64, 8);
        let mut out = run_stage("double", 16, 4, input, |n, tx| async move {
            tokio::time::sleep(Duration::from_millis(n % 3)).await;
            let _ = tx.send(n * 2).await;
        });
        let mut sum = 0u64;
        let mut count = 0usize;
        while let Some(v) = out.recv().await {
            sum += v;
            count += 1;
        }
        assert_eq!(count, 500);
        assert_eq!(sum, (1..=500u64).map(|n| n * 2).sum::<u64>());
    }

    #[tokio::test]
    async fn workers_may_emit_zero_or_many() {
        let input = feed(vec![0usize, 1, 2, 3], 2);
        let mut out = run_stage("fanout", 2, 2, input, |n, tx| async move {
            for i in 0..n {
                let _ = tx.send((n, i)).await;
            }
        });
        let mut got = Vec::new();
        while let Some(v) = out.recv().await { got.push(v); }
        got.sort_unstable();
        assert_eq!(got, vec![(1, 0), (2, 0), (2, 1), (3, 0), (3, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn spawns_one_more_worker_than_requested() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let input = feed(0..12, 12);
        let (l, p) = (live.clone(), peak.clone());
        let mut out = run_stage("peak", 2, 1, input, move |_, tx| {
            let (l, p) = (l.clone(), p.clone());
            async move {
                let now = l.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                l.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(()).await;
            }
        });
        while out.recv().await.is_some() {}
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_input_closes_output() {
        let input = feed(Vec::<u8>::new(), 1);
        let mut out = run_stage("empty", 4, 1, input, |n, tx| async move {
            let _ = tx.send(n).await;
        });
        assert!(out.recv().await.is_none());
    }
}
