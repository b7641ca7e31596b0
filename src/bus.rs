//! Durable bus seam and the default in-process transport
//!
//! The chat talks to its transport through the [`Publisher`] and
//! [`Subscriber`] traits so a durable broker can be swapped in without
//! touching room logic. [`InMemoryBus`] is the default wiring: a
//! process-local topic fan-out where every subscription gets its own
//! ordered pump that waits for an acknowledgement before moving on and
//! redelivers after a negative one. That mirrors the at-least-once
//! discipline of a real broker, minus the durability.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::BusError;

/// Buffered deliveries per subscription before the pump awaits the consumer.
const SUBSCRIPTION_BUFFER: usize = 16;

/// A message crossing the bus: a producer-chosen identifier and an opaque
/// payload.
#[derive(Debug, Clone)]
pub struct BusMessage {
    uuid: String,
    payload: Vec<u8>,
}

impl BusMessage {
    /// Create a bus message with the given identifier and payload.
    pub fn new(uuid: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            uuid: uuid.into(),
            payload,
        }
    }

    /// Producer-assigned message identifier.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Serialized payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Consumer verdict on one delivery.
#[derive(Debug)]
pub(crate) enum Receipt {
    Ack,
    Nack,
}

/// A single message handed to a subscriber.
///
/// Every delivery must be settled with [`Delivery::ack`] or
/// [`Delivery::nack`]; a negative acknowledgement asks the bus to deliver
/// the same message again.
#[derive(Debug)]
pub struct Delivery {
    message: BusMessage,
    receipt: oneshot::Sender<Receipt>,
}

impl Delivery {
    /// Create a delivery and the receiving end of its receipt.
    pub(crate) fn pair(message: BusMessage) -> (Self, oneshot::Receiver<Receipt>) {
        let (receipt, verdict) = oneshot::channel();
        (Self { message, receipt }, verdict)
    }

    /// Identifier of the delivered message.
    pub fn uuid(&self) -> &str {
        self.message.uuid()
    }

    /// Payload of the delivered message.
    pub fn payload(&self) -> &[u8] {
        self.message.payload()
    }

    /// Confirm the delivery; the subscription moves to the next message.
    pub fn ack(self) {
        let _ = self.receipt.send(Receipt::Ack);
    }

    /// Reject the delivery; the same message is delivered again.
    pub fn nack(self) {
        let _ = self.receipt.send(Receipt::Nack);
    }
}

/// Publishing half of the durable bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message to the named topic. Publishing to a topic nobody
    /// subscribes to is not an error.
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError>;
}

/// Subscribing half of the durable bus.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Open an independent subscription receiving every message published
    /// to the topic from this point on, in publish order.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>, BusError>;
}

/// Process-local pub/sub used when no durable bus is configured.
///
/// Every subscription sees every message published to its topic after the
/// subscription was opened. Messages published while a topic has no
/// subscribers are dropped.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl InMemoryBus {
    /// Create an empty in-process bus.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let subscriptions = topics.entry(topic.to_string()).or_default();
        // Queue a copy per subscription, pruning pumps that have ended.
        subscriptions.retain(|pump| pump.send(message.clone()).is_ok());
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let (queue, backlog) = mpsc::unbounded_channel();
        let (deliveries, subscription) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(queue);
        tokio::spawn(pump(backlog, deliveries));
        Ok(subscription)
    }
}

/// Deliver one subscription's backlog in order, waiting for each receipt
/// and redelivering the same message after a negative acknowledgement.
async fn pump(
    mut backlog: mpsc::UnboundedReceiver<BusMessage>,
    deliveries: mpsc::Sender<Delivery>,
) {
    while let Some(message) = backlog.recv().await {
        loop {
            let (delivery, verdict) = Delivery::pair(message.clone());
            if deliveries.send(delivery).await.is_err() {
                // Subscriber dropped its stream; the subscription ends.
                return;
            }
            match verdict.await {
                Ok(Receipt::Ack) => break,
                // A nack and a dropped delivery both warrant redelivery.
                Ok(Receipt::Nack) | Err(_) => continue,
            }
        }
    }
}
