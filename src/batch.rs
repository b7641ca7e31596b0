//! Size and time windowed batching
//!
//! Groups a live channel of items into bounded batches: a batch goes out
//! the moment it reaches the size limit, when the flush interval elapses
//! with items waiting, or as a final remainder when the input closes.

use std::mem;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

/// Group items from `input` into batches of at most `limit`, flushing a
/// partial batch after `flush` of quiet time.
///
/// No item is reordered, duplicated, or dropped, and emitted batches are
/// never empty. The flush timer restarts after every emission regardless
/// of what triggered it, so a steady trickle cannot starve the clock.
/// When `input` closes, whatever is buffered goes out as one final batch
/// and the output closes. `limit` must be at least one and `flush`
/// non-zero.
pub fn batch<T: Send + 'static>(
    input: mpsc::Receiver<T>,
    limit: usize,
    flush: Duration,
) -> mpsc::Receiver<Vec<T>> {
    let (batches, output) = mpsc::channel(limit / 2 + 1);
    tokio::spawn(drive(input, batches, limit, flush));
    output
}

/// Drive the batching loop over explicit channel ends.
///
/// Exits when the input closes, after flushing the remainder, or as soon
/// as the output side stops listening.
pub(crate) async fn drive<T>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<Vec<T>>,
    limit: usize,
    flush: Duration,
) {
    debug_assert!(limit >= 1, "batch limit must admit at least one item");
    debug_assert!(!flush.is_zero(), "flush interval must be non-zero");

    let limit = limit.max(1);
    let mut clock = time::interval(flush);
    clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
    clock.reset(); // skip the immediate first tick
    let mut buffer: Vec<T> = Vec::with_capacity(limit);

    loop {
        tokio::select! {
            item = input.recv() => match item {
                Some(item) => {
                    buffer.push(item);
                    if buffer.len() >= limit {
                        let full = mem::replace(&mut buffer, Vec::with_capacity(limit));
                        if output.send(full).await.is_err() {
                            return;
                        }
                        clock.reset();
                    }
                }
                None => {
                    // Input closed: whatever is left goes out as one final
                    // batch before the output closes.
                    if !buffer.is_empty() {
                        let _ = output.send(buffer).await;
                    }
                    return;
                }
            },
            _ = clock.tick() => {
                if !buffer.is_empty() {
                    let partial = mem::replace(&mut buffer, Vec::with_capacity(limit));
                    if output.send(partial).await.is_err() {
                        return;
                    }
                    clock.reset();
                }
            }
            _ = output.closed() => return,
        }
    }
}
