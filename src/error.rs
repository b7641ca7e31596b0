//! Error types for the chat core
//!
//! Defines chat-level, configuration, and bus transport errors.
//! Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;

/// Boxed error carried across the history repository seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Chat-level errors
///
/// Surfaced at construction and on the producer paths. Consumer-side
/// failures never reach the caller; they are logged and settled against
/// the bus delivery instead.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A configuration value failed validation (construction only)
    #[error("unable to configure chat: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Room name missing on a broadcast or send
    #[error("chat room name is required")]
    EmptyRoomName,

    /// Message content missing on a broadcast or send
    #[error("unable to send an empty message")]
    EmptyContent,

    /// Broadcast envelope could not be encoded for the bus
    #[error("unable to encode broadcast message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The bus rejected a publish; retrying is the bus's contract, not ours
    #[error("unable to publish broadcast message: {0}")]
    Publish(#[source] BusError),

    /// A consumer subscription could not be attached to the bus topic
    #[error("unable to subscribe to bus topic {topic}: {source}")]
    Subscribe {
        /// Topic the subscription was meant for
        topic: String,
        /// Underlying transport failure
        source: BusError,
    },

    /// The history store failed while seeding a room
    #[error("unable to load room history: {0}")]
    History(#[source] BoxError),
}

/// Configuration validation errors
///
/// One variant per offending field, so callers can tell exactly which
/// value was rejected.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Bus topic name left empty
    #[error("bus topic name cannot be empty")]
    EmptyTopic,

    /// History depth would retain no messages at all
    #[error("history depth must retain at least one message, got {0}")]
    HistoryDepth(usize),

    /// History retention shorter than the supported resolution
    #[error("history retention cannot be shorter than one second, got {0:?}")]
    HistoryRetention(Duration),

    /// Sweep frequency shorter than the supported resolution
    #[error("sweep frequency cannot be shorter than one second, got {0:?}")]
    SweepFrequency(Duration),

    /// Idle room timeout shorter than the supported resolution
    #[error("idle room timeout cannot be shorter than one second, got {0:?}")]
    IdleRoomTimeout(Duration),
}

/// Bus transport errors
///
/// Reported by publisher and subscriber implementations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus or topic is no longer accepting messages
    #[error("bus topic is closed")]
    Closed,

    /// Implementation-specific transport failure
    #[error("bus transport failed: {0}")]
    Transport(#[source] BoxError),
}
