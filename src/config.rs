//! Chat construction configuration
//!
//! An explicit configuration value with optional fields. Defaults are
//! applied and every provided value is validated eagerly when the chat is
//! constructed, so a bad setting fails loudly instead of surfacing later
//! as a half-working instance.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{InMemoryBus, Publisher, Subscriber};
use crate::error::ConfigurationError;
use crate::history::{HistoryRepository, VoidHistoryRepository};

/// Bus topic carrying broadcast envelopes when none is configured.
pub const DEFAULT_TOPIC: &str = "roomcast";

/// Most messages retained per room when no depth is configured.
pub const DEFAULT_HISTORY_DEPTH: usize = 1000;

/// Message lifetime before retention sweeps delete it, when unset.
pub const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Pause between retention sweeps when unset.
pub const DEFAULT_SWEEP_FREQUENCY: Duration = Duration::from_secs(15 * 60);

/// Chat construction parameters.
///
/// Every field is optional; `Configuration::default()` yields a working
/// in-process chat. Both bus ends must be provided together, since they
/// have to share one transport; when either is missing a single
/// [`InMemoryBus`] is wired for both.
#[derive(Clone, Default)]
pub struct Configuration {
    /// Bus topic carrying broadcast envelopes; defaults to [`DEFAULT_TOPIC`]
    pub topic: Option<String>,
    /// Durable bus publisher
    pub publisher: Option<Arc<dyn Publisher>>,
    /// Durable bus subscriber; must share the publisher's transport
    pub subscriber: Option<Arc<dyn Subscriber>>,
    /// History retention parameters
    pub history: HistoryConfiguration,
    /// How long a room may sit without subscribers or traffic before the
    /// sweeper evicts it; defaults to the resolved history retention
    pub idle_room_timeout: Option<Duration>,
}

/// History retention parameters nested under [`Configuration`].
#[derive(Clone, Default)]
pub struct HistoryConfiguration {
    /// Store seeding rooms on first access and persisting broadcasts;
    /// defaults to [`VoidHistoryRepository`]
    pub repository: Option<Arc<dyn HistoryRepository>>,
    /// Most messages retained per room, at least one
    pub depth: Option<usize>,
    /// Message lifetime before deletion, at least one second
    pub retention: Option<Duration>,
    /// Pause between retention sweeps, at least one second
    pub sweep_frequency: Option<Duration>,
}

/// Fully resolved and validated settings backing a chat instance.
pub(crate) struct Settings {
    pub(crate) topic: String,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) subscriber: Arc<dyn Subscriber>,
    pub(crate) repository: Arc<dyn HistoryRepository>,
    pub(crate) depth: usize,
    pub(crate) retention: Duration,
    pub(crate) sweep_frequency: Duration,
    pub(crate) idle_room_timeout: Duration,
}

impl Configuration {
    /// Apply defaults and validate every provided value, reporting the first
    /// offending field.
    pub(crate) fn resolve(self) -> Result<Settings, ConfigurationError> {
        let topic = self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        if topic.is_empty() {
            return Err(ConfigurationError::EmptyTopic);
        }

        let depth = self.history.depth.unwrap_or(DEFAULT_HISTORY_DEPTH);
        if depth < 1 {
            return Err(ConfigurationError::HistoryDepth(depth));
        }

        let retention = self.history.retention.unwrap_or(DEFAULT_HISTORY_RETENTION);
        if retention < Duration::from_secs(1) {
            return Err(ConfigurationError::HistoryRetention(retention));
        }

        let sweep_frequency = self
            .history
            .sweep_frequency
            .unwrap_or(DEFAULT_SWEEP_FREQUENCY);
        if sweep_frequency < Duration::from_secs(1) {
            return Err(ConfigurationError::SweepFrequency(sweep_frequency));
        }

        let idle_room_timeout = self.idle_room_timeout.unwrap_or(retention);
        if idle_room_timeout < Duration::from_secs(1) {
            return Err(ConfigurationError::IdleRoomTimeout(idle_room_timeout));
        }

        // Both ends must ride one transport; if either is missing, wire a
        // shared in-process bus for both.
        let (publisher, subscriber) = match (self.publisher, self.subscriber) {
            (Some(publisher), Some(subscriber)) => (publisher, subscriber),
            _ => {
                let bus = Arc::new(InMemoryBus::new());
                (
                    bus.clone() as Arc<dyn Publisher>,
                    bus as Arc<dyn Subscriber>,
                )
            }
        };

        let repository = self
            .history
            .repository
            .unwrap_or_else(|| Arc::new(VoidHistoryRepository));

        Ok(Settings {
            topic,
            publisher,
            subscriber,
            repository,
            depth,
            retention,
            sweep_frequency,
            idle_room_timeout,
        })
    }
}
