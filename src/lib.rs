//! Live Multi-Room Message Fan-Out Library
//!
//! Delivers short text messages to any number of concurrent room
//! subscribers as ordered, batched streams, with bounded in-memory
//! history per room and an optional durable message bus underneath.
//!
//! # Features
//! - Named rooms created on first access and evicted when idle
//! - Ordered fan-out: every subscriber sees every message, in room order
//! - Size- and time-windowed delivery batches (full batch or 300ms)
//! - History replay: new subscribers start with the room's recent past
//! - Depth- and age-bounded history with a periodic retention sweep
//! - Pluggable durable bus and history store behind small traits
//!
//! # Architecture
//! All mutable state sits behind two lock levels:
//! - The `Chat` registry maps room names to live rooms
//! - Each `Room` guards its own history and subscriber queues
//!
//! Producers publish envelopes to the bus; one consumer loop per chat
//! instance applies them to rooms, so in-process and cross-process
//! messages follow the same path. Backpressure is real: a slow subscriber
//! suspends delivery to its room until it drains or the dispatch deadline
//! hands the message back to the bus.
//!
//! # Example
//! ```ignore
//! use roomcast::{Broadcast, Chat, Configuration, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), roomcast::ChatError> {
//!     let chat = Chat::new(Configuration::default()).await?;
//!     let mut lobby = chat.subscribe("lobby").await;
//!
//!     chat.broadcast(Broadcast::new("lobby", Message::new("welcome")))
//!         .await?;
//!
//!     while let Some(batch) = lobby.recv().await {
//!         for message in batch {
//!             println!("{}", message.content);
//!         }
//!     }
//!     chat.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod bus;
pub mod chat;
pub mod config;
mod dedup;
pub mod error;
pub mod history;
pub mod message;
pub mod room;
mod sweep;

// Re-export main types for convenience
pub use batch::batch;
pub use bus::{BusMessage, Delivery, InMemoryBus, Publisher, Subscriber};
pub use chat::Chat;
pub use config::{Configuration, HistoryConfiguration};
pub use error::{BoxError, BusError, ChatError, ConfigurationError};
pub use history::{HistoryRepository, VoidHistoryRepository};
pub use message::{Broadcast, Identity, Message};
pub use room::{BatchStream, Room, RoomClosed};
