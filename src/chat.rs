//! Chat: room registry and durable-bus bridge
//!
//! One `Chat` owns the registry of live rooms, publishes broadcast
//! envelopes to the durable bus, and runs the single consumer loop that
//! applies deliveries to room history and fan-out. Producers never touch
//! room state directly: durable broadcasts and in-process sends meet in
//! one ingestion path, so exactly one code path mutates history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusMessage, Delivery, Publisher};
use crate::config::{Configuration, Settings};
use crate::dedup::RecencySet;
use crate::error::ChatError;
use crate::history::HistoryRepository;
use crate::message::{unix_timestamp, Broadcast, Message};
use crate::room::{BatchStream, Room, RoomClosed};
use crate::sweep::Sweeper;

/// Deadline for applying one bus delivery to its room. Expiry negatively
/// acknowledges the delivery, so a stalled room costs redelivery instead
/// of wedging the consumer loop.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Redelivery guard slots per message of configured history depth.
const SEEN_PER_DEPTH: usize = 2;

/// Registry of live rooms, shared between the chat and its sweeper.
pub(crate) type Registry = Mutex<HashMap<String, Arc<Room>>>;

/// Where an ingested broadcast is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryMode {
    /// Across the durable bus; the consumer loop applies it
    Durable,
    /// Straight into the room, visible to this process only
    Local,
}

/// Live multi-room chat over a durable message bus.
///
/// Cheap to clone; every clone shares one registry and one set of
/// background loops. Dropping the last clone stops the loops;
/// [`Chat::shutdown`] stops and joins them deterministically.
#[derive(Clone)]
pub struct Chat {
    core: Arc<ChatCore>,
    control: Arc<Control>,
}

/// State shared by the public handle and the background loops.
///
/// The loops hold this, never the `Chat` handle itself, so dropping every
/// handle releases the shutdown signal and winds them down.
struct ChatCore {
    topic: String,
    publisher: Arc<dyn Publisher>,
    depth: usize,
    registry: Arc<Registry>,
    repository: Arc<dyn HistoryRepository>,
    seen: StdMutex<RecencySet>,
}

/// Shutdown signalling and the background task handles.
struct Control {
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Chat {
    /// Validate the configuration, attach two bus subscriptions (consumer
    /// loop and history listener), and start the retention sweeper.
    pub async fn new(configuration: Configuration) -> Result<Chat, ChatError> {
        let Settings {
            topic,
            publisher,
            subscriber,
            repository,
            depth,
            retention,
            sweep_frequency,
            idle_room_timeout,
        } = configuration.resolve()?;

        let incoming = subscriber
            .subscribe(&topic)
            .await
            .map_err(|source| ChatError::Subscribe {
                topic: topic.clone(),
                source,
            })?;
        // Independent subscription for the persistence listener, so its
        // settlement pace never stalls live fan-out.
        let persisted = subscriber
            .subscribe(&topic)
            .await
            .map_err(|source| ChatError::Subscribe {
                topic: topic.clone(),
                source,
            })?;

        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let core = Arc::new(ChatCore {
            topic,
            publisher,
            depth,
            registry: registry.clone(),
            repository: repository.clone(),
            seen: StdMutex::new(RecencySet::new(depth.saturating_mul(SEEN_PER_DEPTH))),
        });

        let (shutdown, stop) = watch::channel(false);
        let consumer = tokio::spawn(listen(core.clone(), incoming, stop.clone()));
        let sweeper = Sweeper::new(registry, depth, retention, idle_room_timeout, sweep_frequency);
        let sweep = tokio::spawn(sweeper.run(stop));
        // Lives for as long as its bus subscription does.
        tokio::spawn(async move { repository.listen(persisted).await });

        info!("chat attached to bus topic {}", core.topic);
        Ok(Chat {
            core,
            control: Arc::new(Control {
                shutdown,
                tasks: StdMutex::new(vec![consumer, sweep]),
            }),
        })
    }

    /// Publish a message to the named room through the durable bus.
    ///
    /// Validates synchronously, assigns a fresh identifier, stamps zero
    /// timestamps, and publishes. Delivery into the room happens only when
    /// the envelope comes back through the consumer loop, so every chat
    /// instance sharing the bus applies it the same way.
    pub async fn broadcast(&self, broadcast: Broadcast) -> Result<(), ChatError> {
        self.ingest(broadcast, DeliveryMode::Durable).await
    }

    /// Apply a message to the named room within this process, bypassing
    /// the durable bus. Other instances sharing the bus will not see it.
    ///
    /// Shares every ingestion step with [`Chat::broadcast`] apart from the
    /// delivery leg.
    pub async fn send(
        &self,
        room_name: impl Into<String>,
        message: Message,
    ) -> Result<(), ChatError> {
        self.ingest(Broadcast::new(room_name, message), DeliveryMode::Local)
            .await
    }

    /// Single ingestion path for both delivery modes: validation,
    /// identifier assignment, and timestamp stamping are identical, only
    /// the final leg differs.
    async fn ingest(&self, mut broadcast: Broadcast, mode: DeliveryMode) -> Result<(), ChatError> {
        if broadcast.room_name.is_empty() {
            return Err(ChatError::EmptyRoomName);
        }
        if broadcast.message.content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        broadcast.message.id = Uuid::new_v4().to_string();
        if broadcast.message.created_at == 0 {
            let now = unix_timestamp();
            broadcast.message.created_at = now;
            broadcast.message.updated_at = now;
        }

        match mode {
            DeliveryMode::Durable => {
                let payload = serde_json::to_vec(&broadcast).map_err(ChatError::Encode)?;
                let message = BusMessage::new(broadcast.message.id.clone(), payload);
                self.core
                    .publisher
                    .publish(&self.core.topic, message)
                    .await
                    .map_err(ChatError::Publish)
            }
            DeliveryMode::Local => {
                let Broadcast { room_name, message } = broadcast;
                self.core.dispatch(&room_name, message).await
            }
        }
    }

    /// Attach to the named room, creating it on first access seeded from
    /// the history repository.
    ///
    /// The stream opens with the room's current history as one batch in
    /// ascending creation order (omitted when empty), followed by live
    /// batches. A repository failure degrades to an empty room with a
    /// warning rather than refusing the subscriber.
    pub async fn subscribe(&self, room_name: &str) -> BatchStream {
        loop {
            let room = match self.core.resolve_room(room_name).await {
                Ok(room) => room,
                Err(error) => {
                    warn!("unable to load history for room {}: {}", room_name, error);
                    self.core.insert_room_empty(room_name).await
                }
            };
            match room.subscribe().await {
                Ok(stream) => return stream,
                // Evicted between resolution and attachment.
                Err(_) => continue,
            }
        }
    }

    /// Stop the consumer loop and the sweeper, join them, and close every
    /// room, which ends the subscriber streams once their remaining
    /// batches drain. Safe to call more than once.
    pub async fn shutdown(&self) {
        // Err here means every receiver is already gone, which is what
        // shutdown wants anyway.
        let _ = self.control.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .control
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        // With the loops stopped nothing recreates rooms; dropping them
        // closes every subscriber queue.
        self.core.registry.lock().await.clear();
        info!("chat shut down");
    }
}

impl ChatCore {
    /// Find or create the named room, seeding a new one from the history
    /// repository truncated to the configured depth.
    ///
    /// A room closed by eviction is treated as absent and replaced.
    async fn resolve_room(&self, room_name: &str) -> Result<Arc<Room>, ChatError> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(room_name) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            registry.remove(room_name);
        }
        let history = self
            .repository
            .room_messages(room_name)
            .await
            .map_err(ChatError::History)?;
        let room = Arc::new(Room::with_history(history, self.depth));
        registry.insert(room_name.to_string(), room.clone());
        debug!("room {} created", room_name);
        Ok(room)
    }

    /// Find or create the named room without consulting the history store.
    async fn insert_room_empty(&self, room_name: &str) -> Arc<Room> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(room_name) {
            if !existing.is_closed() {
                return existing.clone();
            }
            registry.remove(room_name);
        }
        let room = Arc::new(Room::new(self.depth));
        registry.insert(room_name.to_string(), room.clone());
        room
    }

    /// Apply one message to its room: resolve (seeding on first access),
    /// then run the guarded append, which admits the identifier through
    /// the redelivery guard and appends inside one room-lock critical
    /// section. A dispatch cancelled before the append leaves the
    /// identifier unadmitted, so its redelivery still applies.
    async fn dispatch(&self, room_name: &str, message: Message) -> Result<(), ChatError> {
        let mut room = self.resolve_room(room_name).await?;
        loop {
            match room.send_deduped(&self.seen, message.clone()).await {
                Ok(true) => return Ok(()),
                // An identifier the guard knows was applied by an earlier
                // delivery of the same message.
                Ok(false) => {
                    debug!("skipping already applied message {}", message.id);
                    return Ok(());
                }
                // Evicted between resolution and append; reach the
                // replacement room.
                Err(RoomClosed) => room = self.resolve_room(room_name).await?,
            }
        }
    }
}

/// Consumer loop: applies bus deliveries to rooms until the subscription
/// closes or shutdown is signalled.
async fn listen(
    core: Arc<ChatCore>,
    mut incoming: mpsc::Receiver<Delivery>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = stop.changed() => break,
            delivery = incoming.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        handle_delivery(&core, delivery).await;
    }
    debug!("chat consumer loop stopped");
}

/// Decode and dispatch one delivery, then settle its receipt.
///
/// A payload that does not decode is acknowledged and dropped so it
/// cannot poison the subscription. A dispatch that overruns its deadline
/// is negatively acknowledged for redelivery; any other dispatch failure
/// is logged, acknowledged, and dropped. Nothing here stops the loop.
async fn handle_delivery(core: &ChatCore, delivery: Delivery) {
    let broadcast: Broadcast = match serde_json::from_slice(delivery.payload()) {
        Ok(broadcast) => broadcast,
        Err(error) => {
            error!(
                "dropping malformed broadcast message {}: {}",
                delivery.uuid(),
                error
            );
            delivery.ack();
            return;
        }
    };
    let Broadcast {
        room_name,
        mut message,
    } = broadcast;
    if room_name.is_empty() {
        error!(
            "dropping broadcast message {} without a room name",
            delivery.uuid()
        );
        delivery.ack();
        return;
    }
    // The bus identifier is authoritative: a redelivery keeps the
    // identifier of its first attempt, which is what the redelivery guard
    // keys on.
    message.id = delivery.uuid().to_string();

    match timeout(DISPATCH_TIMEOUT, core.dispatch(&room_name, message)).await {
        Ok(Ok(())) => delivery.ack(),
        Ok(Err(error)) => {
            error!(
                "dropping undeliverable message {} for room {}: {}",
                delivery.uuid(),
                room_name,
                error
            );
            delivery.ack();
        }
        // Stalled room; hand the message back for a later retry.
        Err(_) => delivery.nack(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, Subscriber};
    use crate::config::HistoryConfiguration;
    use crate::error::{BoxError, BusError};
    use crate::message::Identity;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Instant};

    fn trace_init() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }

    async fn room_handle(chat: &Chat, room_name: &str) -> Option<Arc<Room>> {
        chat.core.registry.lock().await.get(room_name).cloned()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        trace_init();
        let chat = Chat::new(Configuration::default()).await.unwrap();
        let mut lobby = chat.subscribe("lobby").await;

        let author = Identity {
            id: "u-1".to_string(),
            name: "Alice".to_string(),
        };
        chat.broadcast(Broadcast::new(
            "lobby",
            Message::new("hello there").with_author(author),
        ))
        .await
        .unwrap();

        let batch = timeout(Duration::from_secs(3), lobby.recv())
            .await
            .expect("batch within the flush window")
            .expect("stream open");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "hello there");
        assert_eq!(
            batch[0].author.as_ref().map(|a| a.name.as_str()),
            Some("Alice")
        );
        assert!(!batch[0].id.is_empty());
        assert!(batch[0].created_at > 0);
        assert_eq!(batch[0].updated_at, batch[0].created_at);

        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_applies_locally_and_immediately() {
        let chat = Chat::new(Configuration::default()).await.unwrap();
        chat.send("direct", Message::new("no bus involved"))
            .await
            .unwrap();

        // The local leg is synchronous: the room exists before send
        // returns.
        let room = room_handle(&chat, "direct").await.expect("room created");
        let history = room.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "no bus involved");
        assert!(!history[0].id.is_empty());
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_rejects_missing_fields() {
        let chat = Chat::new(Configuration::default()).await.unwrap();

        let err = chat
            .broadcast(Broadcast::new("", Message::new("hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyRoomName));

        let err = chat
            .broadcast(Broadcast::new("lobby", Message::new("")))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyContent));

        let err = chat.send("", Message::new("hi")).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyRoomName));

        let err = chat.send("lobby", Message::new("")).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyContent));

        // Nothing was created along the way.
        assert!(room_handle(&chat, "lobby").await.is_none());
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_construction() {
        let configuration = Configuration {
            history: HistoryConfiguration {
                depth: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = Chat::new(configuration).await.err();
        assert!(matches!(err, Some(ChatError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_history_depth_holds_under_broadcast_load() {
        trace_init();
        let configuration = Configuration {
            history: HistoryConfiguration {
                depth: Some(25),
                ..Default::default()
            },
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();
        for i in 0..51 {
            chat.broadcast(Broadcast::new(
                "retention",
                Message::new(format!("test broadcast {}", i)),
            ))
            .await
            .unwrap();
        }

        // Deliveries apply asynchronously; wait for the last one to land.
        let mut settled = None;
        for _ in 0..300 {
            if let Some(room) = room_handle(&chat, "retention").await {
                let history = room.history().await;
                if history.last().map(|m| m.content.as_str()) == Some("test broadcast 50") {
                    settled = Some(history);
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        let history = settled.expect("all broadcasts applied");
        assert_eq!(history.len(), 25);
        assert_eq!(history[0].content, "test broadcast 26");
        chat.shutdown().await;
    }

    struct CountingRepository {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl HistoryRepository for CountingRepository {
        async fn room_messages(&self, _room_name: &str) -> Result<Vec<Message>, BoxError> {
            Ok(Vec::new())
        }

        async fn listen(&self, mut deliveries: mpsc::Receiver<Delivery>) {
            while let Some(delivery) = deliveries.recv().await {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                delivery.ack();
            }
        }
    }

    #[tokio::test]
    async fn test_history_listener_receives_every_broadcast() {
        let repository = Arc::new(CountingRepository {
            delivered: AtomicUsize::new(0),
        });
        let configuration = Configuration {
            history: HistoryConfiguration {
                repository: Some(repository.clone() as Arc<dyn HistoryRepository>),
                ..Default::default()
            },
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();
        for _ in 0..50 {
            chat.broadcast(Broadcast::new("test-room", Message::new("test message")))
                .await
                .unwrap();
        }

        let mut count = 0;
        for _ in 0..300 {
            count = repository.delivered.load(Ordering::SeqCst);
            if count == 50 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 50);
        chat.shutdown().await;
    }

    struct SeededRepository;

    #[async_trait]
    impl HistoryRepository for SeededRepository {
        async fn room_messages(&self, room_name: &str) -> Result<Vec<Message>, BoxError> {
            Ok((0..3)
                .map(|i| Message {
                    id: format!("seed-{}", i),
                    author: None,
                    content: format!("{} seed {}", room_name, i),
                    created_at: 100 + i,
                    updated_at: 100 + i,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_subscriber_replays_stored_history_first() {
        let configuration = Configuration {
            history: HistoryConfiguration {
                repository: Some(Arc::new(SeededRepository) as Arc<dyn HistoryRepository>),
                ..Default::default()
            },
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();
        let mut stream = chat.subscribe("archive").await;

        let snapshot = timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("snapshot batch")
            .unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].content, "archive seed 0");
        assert_eq!(snapshot[2].content, "archive seed 2");
        chat.shutdown().await;
    }

    struct BrokenRepository;

    #[async_trait]
    impl HistoryRepository for BrokenRepository {
        async fn room_messages(&self, _room_name: &str) -> Result<Vec<Message>, BoxError> {
            Err("history store offline".into())
        }
    }

    #[tokio::test]
    async fn test_store_failure_degrades_subscribe_to_empty_room() {
        trace_init();
        let configuration = Configuration {
            history: HistoryConfiguration {
                repository: Some(Arc::new(BrokenRepository) as Arc<dyn HistoryRepository>),
                ..Default::default()
            },
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();
        let mut stream = chat.subscribe("unlucky").await;

        chat.broadcast(Broadcast::new("unlucky", Message::new("still works")))
            .await
            .unwrap();
        let batch = timeout(Duration::from_secs(3), stream.recv())
            .await
            .expect("live delivery despite the dead store")
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "still works");
        chat.shutdown().await;
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _topic: &str, _message: BusMessage) -> Result<(), BusError> {
            Err(BusError::Closed)
        }
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_to_producer() {
        let bus = Arc::new(InMemoryBus::new());
        let configuration = Configuration {
            publisher: Some(Arc::new(FailingPublisher) as Arc<dyn Publisher>),
            subscriber: Some(bus as Arc<dyn Subscriber>),
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();
        let err = chat
            .broadcast(Broadcast::new("lobby", Message::new("hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Publish(BusError::Closed)));
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applied_once() {
        let chat = Chat::new(Configuration::default()).await.unwrap();
        let message = Message {
            id: "fixed-id".to_string(),
            author: None,
            content: "ride".to_string(),
            created_at: 9,
            updated_at: 9,
        };
        chat.core.dispatch("dup", message.clone()).await.unwrap();
        chat.core.dispatch("dup", message).await.unwrap();

        let room = room_handle(&chat, "dup").await.unwrap();
        assert_eq!(room.history().await.len(), 1);
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_bus_uuid_applied_once() {
        trace_init();
        let bus = Arc::new(InMemoryBus::new());
        let configuration = Configuration {
            publisher: Some(bus.clone() as Arc<dyn Publisher>),
            subscriber: Some(bus.clone() as Arc<dyn Subscriber>),
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();

        let first = serde_json::to_vec(&Broadcast::new(
            "dup-room",
            Message {
                created_at: 5,
                updated_at: 5,
                ..Message::new("one")
            },
        ))
        .unwrap();
        let fresh = serde_json::to_vec(&Broadcast::new(
            "dup-room",
            Message {
                created_at: 6,
                updated_at: 6,
                ..Message::new("two")
            },
        ))
        .unwrap();

        // Same identifier twice, the way a broker redelivers, then a
        // fresh one. The subscription is ordered, so once the fresh
        // message lands both copies of the first were settled.
        let topic = crate::config::DEFAULT_TOPIC;
        bus.publish(topic, BusMessage::new("dup-uuid", first.clone()))
            .await
            .unwrap();
        bus.publish(topic, BusMessage::new("dup-uuid", first))
            .await
            .unwrap();
        bus.publish(topic, BusMessage::new("fresh-uuid", fresh))
            .await
            .unwrap();

        let mut contents: Vec<String> = Vec::new();
        for _ in 0..300 {
            if let Some(room) = room_handle(&chat, "dup-room").await {
                contents = room
                    .history()
                    .await
                    .iter()
                    .map(|m| m.content.clone())
                    .collect();
                if contents.iter().any(|c| c == "two") {
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(contents, vec!["one".to_string(), "two".to_string()]);
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_timeout_redelivery_applies_once() {
        trace_init();
        let configuration = Configuration {
            history: HistoryConfiguration {
                depth: Some(4),
                ..Default::default()
            },
            ..Default::default()
        };
        let chat = Chat::new(configuration).await.unwrap();
        let mut stream = chat.subscribe("clogged").await;

        // An unread subscriber absorbs only a few messages before local
        // sends start blocking; the blocked send keeps holding the room
        // lock.
        let backlog = tokio::spawn({
            let chat = chat.clone();
            async move {
                for i in 0..12 {
                    chat.send("clogged", Message::new(format!("clog {}", i)))
                        .await
                        .unwrap();
                }
            }
        });
        sleep(Duration::from_millis(400)).await;
        assert!(!backlog.is_finished(), "room should be wedged");

        // The consumer loop cannot take the room lock, so this dispatch
        // overruns its deadline and is negatively acknowledged; the bus
        // keeps redelivering it.
        chat.broadcast(Broadcast::new("clogged", Message::new("delayed")))
            .await
            .unwrap();
        sleep(Duration::from_millis(1200)).await;

        // Draining the stream unclogs the room; the redelivered broadcast
        // must land exactly once among the backlog.
        let mut contents: Vec<String> = Vec::new();
        timeout(Duration::from_secs(10), async {
            while contents.len() < 13 {
                let batch = stream.recv().await.expect("stream open");
                contents.extend(batch.into_iter().map(|m| m.content));
            }
        })
        .await
        .expect("redelivered broadcast applied after the room unclogged");
        let delivered = contents.iter().filter(|c| c.as_str() == "delayed").count();
        assert_eq!(delivered, 1);
        assert_eq!(contents.len(), 13);

        backlog.await.unwrap();
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_room_replaced_on_next_send() {
        let chat = Chat::new(Configuration::default()).await.unwrap();
        chat.send("phoenix", Message::new("before eviction"))
            .await
            .unwrap();
        let old = room_handle(&chat, "phoenix").await.unwrap();

        // Force the eviction the sweeper would perform.
        assert!(
            old.close_if_idle(Instant::now() + Duration::from_secs(1))
                .await
        );

        chat.send("phoenix", Message::new("after eviction"))
            .await
            .unwrap();
        let new = room_handle(&chat, "phoenix").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        let history = new.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "after eviction");
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams_and_joins_loops() {
        let chat = Chat::new(Configuration::default()).await.unwrap();
        let mut stream = chat.subscribe("farewell").await;
        chat.broadcast(Broadcast::new("farewell", Message::new("last words")))
            .await
            .unwrap();
        let batch = timeout(Duration::from_secs(3), stream.recv())
            .await
            .expect("delivery before shutdown")
            .unwrap();
        assert_eq!(batch[0].content, "last words");

        chat.shutdown().await;
        let drained = timeout(Duration::from_secs(2), async {
            while stream.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "stream should end after shutdown");

        // A second shutdown has nothing left to stop.
        chat.shutdown().await;
    }
}
