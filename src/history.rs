//! History repository seam
//!
//! Rooms are seeded from a repository on first access, and every broadcast
//! crossing the bus is offered to the repository's listener over an
//! independent subscription, so persistence pace never stalls live
//! fan-out.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::Delivery;
use crate::error::BoxError;
use crate::message::Message;

/// External persistence backend for room message history.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Recent messages of the named room in ascending creation order. The
    /// chat truncates the result to its configured history depth.
    async fn room_messages(&self, room_name: &str) -> Result<Vec<Message>, BoxError>;

    /// Persist broadcast envelopes arriving on a dedicated bus
    /// subscription.
    ///
    /// Runs as a background task for the lifetime of the chat.
    /// Implementations own their settlement discipline and must eventually
    /// acknowledge every delivery; the default acknowledges without
    /// storing anything.
    async fn listen(&self, mut deliveries: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            delivery.ack();
        }
    }
}

/// Repository that keeps nothing.
///
/// Rooms always seed empty and broadcasts are acknowledged unread. Used
/// when no repository is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidHistoryRepository;

#[async_trait]
impl HistoryRepository for VoidHistoryRepository {
    async fn room_messages(&self, _room_name: &str) -> Result<Vec<Message>, BoxError> {
        Ok(Vec::new())
    }
}
