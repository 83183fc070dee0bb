//! # In-Memory Broker
//!
//! A single-process broker with AMQP-like semantics:
//!
//! - direct and fanout exchanges, plus the default exchange (`""`) which
//!   routes to the queue named by the routing key
//! - a "not found" error on a channel closes that channel
//! - mandatory publishes that match no queue come back as returns
//! - exclusive queues are deleted together with the channel that owns them
//!
//! Besides implementing the client traits it exposes a worker-side API
//! ([`InMemoryBroker::subscribe`], [`InMemoryBroker::publish`]) and a few
//! fault-injection hooks for tests.

use crate::client::{BusChannel, BusConnection, BusConnector, Connected, OpenedChannel};
use crate::error::BusError;
use crate::message::{
    ChannelEvent, ConnectionParams, ExchangeKind, InboundMessage, MessageProperties,
};
use crate::GENERATED_QUEUE_PREFIX;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// The nameless exchange every queue is implicitly bound to.
const DEFAULT_EXCHANGE: &str = "";

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    /// Total messages published (routed or not).
    messages_published: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u16, ChannelSlot>,
    connections: HashMap<u64, mpsc::UnboundedSender<BusError>>,
    published: HashMap<String, u64>,
    /// Observers receiving a copy of everything published to an exchange.
    taps: HashMap<String, Vec<mpsc::UnboundedSender<InboundMessage>>>,
    denied_binds: HashSet<String>,
    refuse_connections: bool,
    fail_close: bool,
    next_channel_id: u16,
    next_connection_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct QueueState {
    /// Channel owning an exclusive queue.
    owner: Option<u16>,
    consumer: Option<Consumer>,
    backlog: VecDeque<InboundMessage>,
}

enum Consumer {
    Channel(u16),
    External(mpsc::UnboundedSender<InboundMessage>),
}

struct ChannelSlot {
    connection_id: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

fn no_exchange(exchange: &str) -> BusError {
    BusError::NotFound(format!("no exchange '{}' in vhost '/'", exchange))
}

fn no_queue(queue: &str) -> BusError {
    BusError::NotFound(format!("no queue '{}' in vhost '/'", queue))
}

impl BrokerState {
    fn ensure_open(&self, channel_id: u16) -> Result<(), BusError> {
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(BusError::ChannelClosed)
        }
    }

    fn exchange_exists(&self, exchange: &str) -> bool {
        exchange == DEFAULT_EXCHANGE || self.exchanges.contains_key(exchange)
    }

    /// Close a channel after `err`, and hand `err` back for the caller.
    fn fail_channel(&mut self, channel_id: u16, err: BusError) -> BusError {
        self.close_channel(channel_id, Some(err.clone()));
        err
    }

    fn close_channel(&mut self, channel_id: u16, fault: Option<BusError>) {
        let Some(slot) = self.channels.remove(&channel_id) else {
            return;
        };

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(channel_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !owned.contains(&b.queue));

        for queue in self.queues.values_mut() {
            if matches!(queue.consumer, Some(Consumer::Channel(id)) if id == channel_id) {
                queue.consumer = None;
            }
        }

        debug!(
            channel_id = channel_id,
            deleted_queues = owned.len(),
            fault = ?fault,
            "Channel closed"
        );

        if let Some(err) = fault {
            let _ = slot.events.send(ChannelEvent::Fault(err));
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange == DEFAULT_EXCHANGE {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        let kind = match self.exchanges.get(exchange) {
            Some(kind) => *kind,
            None => return Vec::new(),
        };

        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        queues.dedup();
        queues
    }

    fn deliver(&mut self, queue: &str, message: InboundMessage) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        let delivered = match &state.consumer {
            Some(Consumer::Channel(id)) => self
                .channels
                .get(id)
                .map(|slot| {
                    slot.events
                        .send(ChannelEvent::Delivery(message.clone()))
                        .is_ok()
                })
                .unwrap_or(false),
            Some(Consumer::External(tx)) => tx.send(message.clone()).is_ok(),
            None => false,
        };

        if !delivered {
            state.consumer = None;
            state.backlog.push_back(message);
        }
    }

    /// Route and deliver. Returns the number of queues the message reached.
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> (usize, InboundMessage) {
        *self.published.entry(exchange.to_string()).or_insert(0) += 1;

        let message = InboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
        };

        if let Some(taps) = self.taps.get_mut(exchange) {
            taps.retain(|tap| tap.send(message.clone()).is_ok());
        }

        let targets = self.route(exchange, routing_key);
        for queue in &targets {
            self.deliver(queue, message.clone());
        }
        (targets.len(), message)
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exchange. Redeclaring an existing exchange is a no-op.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.shared
            .state
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_insert(kind);
    }

    /// Delete an exchange and its bindings.
    pub fn delete_exchange(&self, name: &str) {
        let mut state = self.shared.state.lock();
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
    }

    /// Declare a shared (non-exclusive) queue.
    pub fn declare_queue(&self, name: &str) {
        self.shared
            .state
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
    }

    /// Bind a queue to an exchange from outside any channel.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(no_exchange(exchange));
        }
        if !state.queues.contains_key(queue) {
            return Err(no_queue(queue));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    /// Consume a queue from outside any channel (worker side).
    ///
    /// Messages already waiting on the queue are delivered first.
    pub fn subscribe(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<InboundMessage>, BusError> {
        let mut state = self.shared.state.lock();
        let entry = state.queues.get_mut(queue).ok_or_else(|| no_queue(queue))?;

        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(message) = entry.backlog.pop_front() {
            let _ = tx.send(message);
        }
        entry.consumer = Some(Consumer::External(tx));
        Ok(rx)
    }

    /// Publish from outside any channel (worker side).
    ///
    /// Not mandatory: unroutable messages are dropped. Returns the number of
    /// queues reached.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        properties: MessageProperties,
    ) -> Result<usize, BusError> {
        let mut state = self.shared.state.lock();
        if !state.exchange_exists(exchange) {
            return Err(no_exchange(exchange));
        }
        self.shared.messages_published.fetch_add(1, Ordering::Relaxed);
        let (routed, _) = state.publish(exchange, routing_key, body.into(), properties);
        if routed == 0 {
            debug!(exchange = exchange, routing_key = routing_key, "Message dropped (unroutable)");
        }
        Ok(routed)
    }

    /// Copy every later publish to `exchange`, routed or not.
    pub fn tap(&self, exchange: &str) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .state
            .lock()
            .taps
            .entry(exchange.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Make every bind to `exchange` fail with "access refused".
    ///
    /// The channel stays open, unlike a "not found" failure.
    pub fn deny_binds_to(&self, exchange: &str) {
        self.shared
            .state
            .lock()
            .denied_binds
            .insert(exchange.to_string());
    }

    /// Refuse all future connection attempts.
    pub fn refuse_connections(&self) {
        self.shared.state.lock().refuse_connections = true;
    }

    /// Make [`BusConnection::close`] fail.
    pub fn fail_close(&self) {
        self.shared.state.lock().fail_close = true;
    }

    /// Close a channel as if the broker raised `err` on it.
    pub fn inject_channel_fault(&self, channel_id: u16, err: BusError) {
        warn!(channel_id = channel_id, error = %err, "Injecting channel fault");
        self.shared.state.lock().close_channel(channel_id, Some(err));
    }

    /// Raise `err` on every open connection.
    pub fn fail_connections(&self, err: BusError) {
        let state = self.shared.state.lock();
        for faults in state.connections.values() {
            let _ = faults.send(err.clone());
        }
    }

    /// Ids of currently open channels, ascending.
    #[must_use]
    pub fn open_channels(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.shared.state.lock().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `queue` is bound to `exchange` (any routing key).
    #[must_use]
    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange)
    }

    /// Whether a queue currently exists.
    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    /// Number of messages published to `exchange` (routed or not).
    #[must_use]
    pub fn published_to(&self, exchange: &str) -> u64 {
        self.shared
            .state
            .lock()
            .published
            .get(exchange)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of messages published.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.shared.messages_published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BusConnector for InMemoryBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Connected, BusError> {
        let mut state = self.shared.state.lock();
        if state.refuse_connections {
            return Err(BusError::AccessRefused(format!(
                "login refused for user '{}'",
                params.login
            )));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (faults_tx, faults) = mpsc::unbounded_channel();
        state.connections.insert(id, faults_tx);

        debug!(connection_id = id, params = %params, "Connection opened");

        Ok(Connected {
            connection: Arc::new(MemoryConnection {
                id,
                shared: Arc::clone(&self.shared),
            }),
            faults,
        })
    }
}

/// Connection handed out by [`InMemoryBroker`].
struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<OpenedChannel, BusError> {
        let mut state = self.shared.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BusError::ConnectionClosed);
        }

        state.next_channel_id = state.next_channel_id.wrapping_add(1).max(1);
        let id = state.next_channel_id;
        let (events_tx, events) = mpsc::unbounded_channel();
        state.channels.insert(
            id,
            ChannelSlot {
                connection_id: self.id,
                events: events_tx,
            },
        );

        debug!(connection_id = self.id, channel_id = id, "Channel opened");

        Ok(OpenedChannel {
            channel: Arc::new(MemoryChannel {
                id,
                shared: Arc::clone(&self.shared),
            }),
            events,
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        if state.fail_close {
            return Err(BusError::Io("connection reset during close".into()));
        }
        if state.connections.remove(&self.id).is_none() {
            return Err(BusError::ConnectionClosed);
        }

        let channels: Vec<u16> = state
            .channels
            .iter()
            .filter(|(_, slot)| slot.connection_id == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            state.close_channel(id, None);
        }

        debug!(connection_id = self.id, "Connection closed");
        Ok(())
    }
}

/// Channel handed out by [`MemoryConnection`].
struct MemoryChannel {
    id: u16,
    shared: Arc<Shared>,
}

#[async_trait]
impl BusChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn check_exchange(&self, exchange: &str) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        state.ensure_open(self.id)?;
        if state.exchange_exists(exchange) {
            Ok(())
        } else {
            Err(state.fail_channel(self.id, no_exchange(exchange)))
        }
    }

    async fn declare_reply_queue(&self) -> Result<String, BusError> {
        let mut state = self.shared.state.lock();
        state.ensure_open(self.id)?;

        let name = format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple());
        state.queues.insert(
            name.clone(),
            QueueState {
                owner: Some(self.id),
                ..QueueState::default()
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        state.ensure_open(self.id)?;

        if state.denied_binds.contains(exchange) {
            return Err(BusError::AccessRefused(format!(
                "bind of queue '{}' to exchange '{}' refused",
                queue, exchange
            )));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(state.fail_channel(self.id, no_exchange(exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(state.fail_channel(self.id, no_queue(queue)));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        state.ensure_open(self.id)?;

        let backlog: Vec<InboundMessage> = match state.queues.get_mut(queue) {
            Some(entry) => {
                entry.consumer = Some(Consumer::Channel(self.id));
                entry.backlog.drain(..).collect()
            }
            None => return Err(state.fail_channel(self.id, no_queue(queue))),
        };

        if let Some(slot) = state.channels.get(&self.id) {
            for message in backlog {
                let _ = slot.events.send(ChannelEvent::Delivery(message));
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        state.ensure_open(self.id)?;
        if !state.exchange_exists(exchange) {
            return Err(state.fail_channel(self.id, no_exchange(exchange)));
        }

        self.shared.messages_published.fetch_add(1, Ordering::Relaxed);
        let (routed, message) = state.publish(exchange, routing_key, body, properties);

        if routed == 0 {
            debug!(
                channel_id = self.id,
                exchange = exchange,
                routing_key = routing_key,
                "Mandatory message unroutable, returning"
            );
            if let Some(slot) = state.channels.get(&self.id) {
                let _ = slot.events.send(ChannelEvent::Returned(message));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open(broker: &InMemoryBroker) -> (Connected, OpenedChannel) {
        let connected = broker.connect(&ConnectionParams::default()).await.unwrap();
        let opened = connected.connection.open_channel().await.unwrap();
        (connected, opened)
    }

    #[tokio::test]
    async fn test_check_missing_exchange_closes_channel() {
        let broker = InMemoryBroker::new();
        let (_conn, mut opened) = open(&broker).await;

        let err = opened.channel.check_exchange("nope").await.unwrap_err();
        assert!(err.is_not_found());

        let event = timeout(Duration::from_millis(100), opened.events.recv())
            .await
            .expect("timeout")
            .expect("event");
        assert!(matches!(event, ChannelEvent::Fault(e) if e.is_not_found()));

        // Stream ends once the channel is gone
        assert!(opened.events.recv().await.is_none());
        assert!(matches!(
            opened.channel.check_exchange("nope").await,
            Err(BusError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_reply_queue_routing() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("echoResponse", ExchangeKind::Direct);
        let (_conn, mut opened) = open(&broker).await;

        let queue = opened.channel.declare_reply_queue().await.unwrap();
        assert!(queue.starts_with(GENERATED_QUEUE_PREFIX));
        opened
            .channel
            .bind_queue(&queue, "echoResponse", &queue)
            .await
            .unwrap();
        opened.channel.consume(&queue).await.unwrap();

        let routed = broker
            .publish(
                "echoResponse",
                &queue,
                "hello",
                MessageProperties::new().with_correlation_id("c-1"),
            )
            .unwrap();
        assert_eq!(routed, 1);

        match opened.events.recv().await {
            Some(ChannelEvent::Delivery(message)) => {
                assert_eq!(message.body, Bytes::from("hello"));
                assert_eq!(message.correlation_id(), Some("c-1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unroutable_mandatory_publish_is_returned() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("lonelyRequest", ExchangeKind::Direct);
        let (_conn, mut opened) = open(&broker).await;

        opened
            .channel
            .publish(
                "lonelyRequest",
                "",
                Bytes::from_static(b"x"),
                MessageProperties::new().with_correlation_id("c-2"),
            )
            .await
            .unwrap();

        match opened.events.recv().await {
            Some(ChannelEvent::Returned(message)) => {
                assert_eq!(message.correlation_id(), Some("c-2"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(broker.published_to("lonelyRequest"), 1);
    }

    #[tokio::test]
    async fn test_tap_sees_unroutable_publish() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("lonelyRequest", ExchangeKind::Direct);
        let mut tap = broker.tap("lonelyRequest");

        let routed = broker
            .publish(
                "lonelyRequest",
                "nowhere",
                "x",
                MessageProperties::new().with_correlation_id("c-3"),
            )
            .unwrap();

        assert_eq!(routed, 0);
        let copy = tap.try_recv().unwrap();
        assert_eq!(copy.routing_key, "nowhere");
        assert_eq!(copy.correlation_id(), Some("c-3"));
    }

    #[tokio::test]
    async fn test_fanout_ignores_routing_key() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("fan", ExchangeKind::Fanout);
        broker.declare_queue("a");
        broker.declare_queue("b");
        broker.bind("a", "fan", "x").unwrap();
        broker.bind("b", "fan", "y").unwrap();

        let routed = broker
            .publish("fan", "z", "m", MessageProperties::new())
            .unwrap();
        assert_eq!(routed, 2);
    }

    #[tokio::test]
    async fn test_subscribe_drains_backlog() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("work");
        broker
            .publish("", "work", "early", MessageProperties::new())
            .unwrap();

        let mut rx = broker.subscribe("work").unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.body, Bytes::from("early"));
    }

    #[tokio::test]
    async fn test_exclusive_queue_deleted_with_channel() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("r", ExchangeKind::Direct);
        let (_conn, opened) = open(&broker).await;

        let queue = opened.channel.declare_reply_queue().await.unwrap();
        opened.channel.bind_queue(&queue, "r", &queue).await.unwrap();
        assert!(broker.is_bound(&queue, "r"));

        broker.inject_channel_fault(opened.channel.id(), BusError::Protocol("boom".into()));
        assert!(!broker.queue_exists(&queue));
        assert!(!broker.is_bound(&queue, "r"));
        assert!(broker.open_channels().is_empty());
    }

    #[tokio::test]
    async fn test_denied_bind_keeps_channel_open() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("locked", ExchangeKind::Direct);
        broker.deny_binds_to("locked");
        let (_conn, opened) = open(&broker).await;

        let queue = opened.channel.declare_reply_queue().await.unwrap();
        let err = opened
            .channel
            .bind_queue(&queue, "locked", &queue)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::AccessRefused(_)));
        assert_eq!(broker.open_channels(), vec![opened.channel.id()]);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections();
        let result = broker.connect(&ConnectionParams::default()).await;
        assert!(matches!(result, Err(BusError::AccessRefused(_))));
    }

    #[tokio::test]
    async fn test_close_connection_closes_channels() {
        let broker = InMemoryBroker::new();
        let (connected, mut opened) = open(&broker).await;

        connected.connection.close().await.unwrap();
        assert!(broker.open_channels().is_empty());
        assert!(opened.events.recv().await.is_none());
        assert!(matches!(
            connected.connection.open_channel().await,
            Err(BusError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connection_faults_are_broadcast() {
        let broker = InMemoryBroker::new();
        let (mut connected, _opened) = open(&broker).await;

        broker.fail_connections(BusError::Io("heartbeat missed".into()));
        let fault = connected.faults.recv().await.unwrap();
        assert_eq!(fault, BusError::Io("heartbeat missed".into()));
    }
}
