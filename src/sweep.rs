//! Periodic retention sweep and idle room eviction
//!
//! Every tick trims each room's history by age and by count, then evicts
//! rooms that sat without subscribers or traffic past the idle timeout.
//! The registry lock is held only to snapshot the room handles and to
//! delete evicted entries; the trims themselves run against each room's
//! own lock, so a busy room never stalls the whole sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::chat::Registry;
use crate::message::unix_timestamp;
use crate::room::Room;

/// Background task enforcing history retention and room lifetime.
pub(crate) struct Sweeper {
    registry: Arc<Registry>,
    depth: usize,
    retention: Duration,
    idle_timeout: Duration,
    frequency: Duration,
}

impl Sweeper {
    pub(crate) fn new(
        registry: Arc<Registry>,
        depth: usize,
        retention: Duration,
        idle_timeout: Duration,
        frequency: Duration,
    ) -> Self {
        Self {
            registry,
            depth,
            retention,
            idle_timeout,
            frequency,
        }
    }

    /// Sweep at the configured frequency until shutdown is signalled or
    /// every chat handle is gone.
    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut clock = time::interval(self.frequency);
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
        clock.reset(); // first sweep one full period from now
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = clock.tick() => {
                    let cutoff = self.retention_cutoff();
                    // A process younger than the idle timeout cannot have
                    // idle rooms yet.
                    let idle_before = Instant::now().checked_sub(self.idle_timeout);
                    self.sweep_once(cutoff, idle_before).await;
                }
            }
        }
        debug!("retention sweeper stopped");
    }

    /// Oldest creation time (unix seconds) the retention window still
    /// keeps. Saturates, so an extreme retention never reaches into the
    /// present.
    fn retention_cutoff(&self) -> i64 {
        let window = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        unix_timestamp().saturating_sub(window)
    }

    /// One sweep pass: trim every room, then evict the idle ones.
    pub(crate) async fn sweep_once(&self, cutoff: i64, idle_before: Option<Instant>) {
        debug!("sweeping expired messages");
        let rooms: Vec<(String, Arc<Room>)> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .map(|(name, room)| (name.clone(), room.clone()))
                .collect()
        };

        let mut evicted: Vec<(String, Arc<Room>)> = Vec::new();
        for (name, room) in rooms {
            let removed = room.clean_out(cutoff, self.depth).await;
            if removed > 0 {
                debug!("removed {} expired messages from room {}", removed, name);
            }
            if let Some(idle_before) = idle_before {
                if room.close_if_idle(idle_before).await {
                    evicted.push((name, room));
                }
            }
        }

        if !evicted.is_empty() {
            let mut registry = self.registry.lock().await;
            for (name, room) in evicted {
                // A fresh room may have replaced the closed one after a
                // racing resolve; only delete the exact room we closed.
                if registry
                    .get(&name)
                    .is_some_and(|current| Arc::ptr_eq(current, &room))
                {
                    registry.remove(&name);
                    info!("evicted idle room {}", name);
                }
            }
        }
    }
}
