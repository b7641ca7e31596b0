//! Room: bounded history and live subscriber fan-out
//!
//! A room owns an ordered, depth-bounded history and the set of live
//! subscriber queues, both behind one async lock. Sending appends to
//! history (evicting the oldest entry at capacity) and pushes the message
//! to every subscriber queue in registration order; a full queue suspends
//! the whole send until that subscriber drains, which is deliberate
//! backpressure rather than a silent drop.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::batch;
use crate::dedup::RecencySet;
use crate::message::Message;

/// Pause between time-triggered batch flushes to a subscriber.
const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// The room was evicted from the registry; the caller must resolve the
/// name again to reach the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("room is closed")]
pub struct RoomClosed;

/// A registered subscriber egress queue.
struct Subscriber {
    id: u64,
    queue: mpsc::Sender<Message>,
}

/// Room state behind the room lock.
struct RoomState {
    /// Ordered history, oldest at the front, never longer than the depth
    messages: VecDeque<Message>,
    /// Live subscriber queues in registration order
    subscribers: Vec<Subscriber>,
    /// Registration counter, so queues can be unregistered by identity
    next_subscriber_id: u64,
    /// Last send or subscribe, for idle eviction
    last_active: Instant,
}

/// A named partition of message history and live subscribers.
///
/// Rooms are always reached through the chat registry; the registry entry
/// holds them alive and eviction closes them for good.
pub struct Room {
    depth: usize,
    closed: AtomicBool,
    state: Arc<Mutex<RoomState>>,
}

impl Room {
    /// Create an empty room retaining at most `depth` messages.
    pub fn new(depth: usize) -> Self {
        Self::with_history(Vec::new(), depth)
    }

    /// Create a room seeded with history in ascending creation order.
    /// Seeds beyond the depth are discarded from the oldest end.
    pub(crate) fn with_history(history: Vec<Message>, depth: usize) -> Self {
        let depth = depth.max(1);
        let mut messages = VecDeque::with_capacity(depth);
        let skip = history.len().saturating_sub(depth);
        messages.extend(history.into_iter().skip(skip));
        Self {
            depth,
            closed: AtomicBool::new(false),
            state: Arc::new(Mutex::new(RoomState {
                messages,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                last_active: Instant::now(),
            })),
        }
    }

    /// Append a message to history and fan it out to every live
    /// subscriber.
    ///
    /// At capacity the oldest entry is evicted first. A full subscriber
    /// queue suspends the send until that subscriber drains or the caller
    /// gives up by dropping the future; the bus consumer bounds every
    /// dispatch with its own deadline for exactly that reason. Sending to
    /// a room without subscribers still appends.
    pub async fn send(&self, message: Message) -> Result<(), RoomClosed> {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomClosed);
        }
        Self::apply(&mut state, self.depth, message).await;
        Ok(())
    }

    /// Append and fan out like [`Room::send`], unless the redelivery guard
    /// already admitted this message identifier; reports whether the
    /// message was applied.
    ///
    /// The admission check runs under the room lock with no await between
    /// it and the append, so an identifier is marked seen exactly when its
    /// message reaches history: a dispatch cancelled while waiting for the
    /// lock leaves the identifier unmarked and its redelivery applies.
    /// Messages without an identifier bypass the guard.
    pub(crate) async fn send_deduped(
        &self,
        seen: &StdMutex<RecencySet>,
        message: Message,
    ) -> Result<bool, RoomClosed> {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomClosed);
        }
        if !message.id.is_empty()
            && !seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(&message.id)
        {
            return Ok(false);
        }
        Self::apply(&mut state, self.depth, message).await;
        Ok(true)
    }

    // Runs inside the room lock's critical section.
    async fn apply(state: &mut RoomState, depth: usize, message: Message) {
        state.last_active = Instant::now();
        if state.messages.len() >= depth {
            state.messages.pop_front();
        }
        state.messages.push_back(message.clone());

        // Fan out in registration order, pruning queues whose stream side
        // is gone.
        let mut gone: Vec<u64> = Vec::new();
        for subscriber in &state.subscribers {
            if subscriber.queue.send(message.clone()).await.is_err() {
                gone.push(subscriber.id);
            }
        }
        if !gone.is_empty() {
            state.subscribers.retain(|s| !gone.contains(&s.id));
        }
    }

    /// Attach a new subscriber: a live batched stream primed with a
    /// snapshot of the current history as its first batch.
    ///
    /// The snapshot goes out whole; live batches carry at most the
    /// subscriber queue capacity, with partial batches flushed every 300ms
    /// while messages trickle in. The stream ends when the room is evicted
    /// or the chat shuts down; dropping the stream unregisters the
    /// subscriber.
    pub async fn subscribe(&self) -> Result<BatchStream, RoomClosed> {
        let queue_capacity = self.queue_capacity();
        let (queue, feed) = mpsc::channel(queue_capacity);

        let (snapshot, id) = {
            let mut state = self.state.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(RoomClosed);
            }
            state.last_active = Instant::now();
            let snapshot: Vec<Message> = state.messages.iter().cloned().collect();
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.push(Subscriber { id, queue });
            (snapshot, id)
        };

        let (batches, stream) = mpsc::channel(queue_capacity / 2 + 1);
        if !snapshot.is_empty() {
            // The channel is freshly created, so the snapshot always fits.
            let _ = batches.try_send(snapshot);
        }

        // The pipeline task holds the state weakly so it cannot keep the
        // room alive: once the registry entry goes, dropping the room
        // closes every queue and the batcher winds down on its own.
        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            batch::drive(feed, batches, queue_capacity, FLUSH_INTERVAL).await;
            // Detach the queue promptly rather than waiting for a send
            // to prune it.
            if let Some(state) = state.upgrade() {
                state.lock().await.subscribers.retain(|s| s.id != id);
            }
        });

        Ok(BatchStream { batches: stream })
    }

    /// Delete messages created before `cutoff` (unix seconds), then drop
    /// the oldest entries exceeding `limit`. Returns how many were
    /// removed.
    pub async fn clean_out(&self, cutoff: i64, limit: usize) -> usize {
        let mut state = self.state.lock().await;
        let before = state.messages.len();
        state.messages.retain(|m| m.created_at >= cutoff);
        let excess = state.messages.len().saturating_sub(limit);
        if excess > 0 {
            state.messages.drain(..excess);
        }
        before - state.messages.len()
    }

    /// Snapshot of the current history in ascending creation order.
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.messages.iter().cloned().collect()
    }

    /// Number of live subscriber queues.
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    /// Close the room if it has no subscribers and saw no activity since
    /// `idle_before`. A closed room rejects sends and subscriptions, which
    /// makes callers resolve the name again; reports whether the room is
    /// closed afterwards.
    pub(crate) async fn close_if_idle(&self, idle_before: Instant) -> bool {
        let state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        if !state.subscribers.is_empty() || state.last_active >= idle_before {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    /// Whether the room was closed by eviction.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Sized so a quarter of the history depth may sit unread per
    // subscriber before sends start waiting on it.
    fn queue_capacity(&self) -> usize {
        self.depth / 4 + 1
    }
}

/// Live stream of message batches for one subscriber.
///
/// Yields non-empty batches in room order: first the history snapshot,
/// then size- and time-windowed groups of newly sent messages. Ends after
/// the room goes away once every remaining message has been yielded;
/// dropping the stream detaches the subscriber.
pub struct BatchStream {
    batches: mpsc::Receiver<Vec<Message>>,
}

impl BatchStream {
    /// Receive the next batch, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Vec<Message>> {
        self.batches.recv().await
    }
}

impl Stream for BatchStream {
    type Item = Vec<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().batches.poll_recv(cx)
    }
}
