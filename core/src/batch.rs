//! Size/time windowed batching of a channel.

use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(10);

/// Group items from `input` into batches of at most `size`.
///
/// A partial batch is flushed once `max_interval` has passed since the last
/// flush. When the input closes or `cancel` fires, whatever is buffered is
/// flushed and the output closes.
pub fn batch<T: Send + 'static>(
    mut input: Receiver<T>,
    size: usize,
    max_interval: Duration,
    cancel: CancellationToken,
) -> Receiver<Vec<T>> {
    let size = size.max(1);
    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        let mut buf = Vec::with_capacity(size);
        let mut last_output = Instant::now();
        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                item = input.recv() => {
                    let Some(item) = item else { break };
                    buf.push(item);
                    if buf.len() >= size {
                        let full = std::mem::replace(&mut buf, Vec::with_capacity(size));
                        if tx.send(full).await.is_err() { return; }
                        last_output = Instant::now();
                    }
                }
                _ = tick.tick() => {
                    if !buf.is_empty() && last_output.elapsed() > max_interval {
                        let partial = std::mem::replace(&mut buf, Vec::with_capacity(size));
                        if tx.send(partial).await.is_err() { return; }
                        last_output = Instant::now();
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        if !buf.is_empty() {
            let _ = tx.send(buf).await;
        }
    });
    rx
}
