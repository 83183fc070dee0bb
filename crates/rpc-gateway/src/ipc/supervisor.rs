//! Channel Supervisor - owns the active channel and its reply queue.
//!
//! Exactly one channel is current at a time. It is replaced whenever the
//! broker closes it with a "not found" fault (a passive declare or bind that
//! named a missing exchange). Any other fault ends supervision.
//!
//! All bus events for the current channel are handled by [`ChannelSupervisor::run`],
//! a single loop that also performs the replacement.

use crate::domain::correlation::CorrelationId;
use crate::domain::error::GatewayError;
use crate::domain::pending::CorrelationTable;
use crate::domain::types::RpcResult;
use dashmap::DashSet;
use parking_lot::RwLock;
use shared_bus::{BusChannel, BusConnection, BusError, ChannelEvent, ChannelEvents, InboundMessage, OpenedChannel};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// An installed channel together with its reply queue.
pub struct ActiveChannel {
    channel: Arc<dyn BusChannel>,
    reply_queue: String,
    /// Response exchanges the reply queue is bound to on this channel.
    bindings: DashSet<String>,
}

impl ActiveChannel {
    fn new(channel: Arc<dyn BusChannel>, reply_queue: String) -> Self {
        Self {
            channel,
            reply_queue,
            bindings: DashSet::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.channel.id()
    }

    pub fn channel(&self) -> &dyn BusChannel {
        self.channel.as_ref()
    }

    /// Server-generated name of the reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Whether the reply queue is already bound to `exchange`.
    pub fn is_bound(&self, exchange: &str) -> bool {
        self.bindings.contains(exchange)
    }

    /// Bind the reply queue to `exchange` unless already done on this
    /// channel. The binding key is the queue's own name.
    pub async fn ensure_bound(&self, exchange: &str) -> Result<(), BusError> {
        if self.is_bound(exchange) {
            return Ok(());
        }

        self.channel
            .bind_queue(&self.reply_queue, exchange, &self.reply_queue)
            .await?;
        self.bindings.insert(exchange.to_string());

        debug!(
            channel_id = self.id(),
            exchange = exchange,
            reply_queue = %self.reply_queue,
            "Reply queue bound"
        );
        Ok(())
    }
}

/// Owns the current channel and dispatches its events.
pub struct ChannelSupervisor {
    connection: Arc<dyn BusConnection>,
    table: Arc<CorrelationTable>,
    current: RwLock<Option<Arc<ActiveChannel>>>,
    /// Signalled whenever a channel is installed.
    installed: Notify,
    shutting_down: AtomicBool,
    recreations: AtomicU64,
}

impl ChannelSupervisor {
    pub fn new(connection: Arc<dyn BusConnection>, table: Arc<CorrelationTable>) -> Self {
        Self {
            connection,
            table,
            current: RwLock::new(None),
            installed: Notify::new(),
            shutting_down: AtomicBool::new(false),
            recreations: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current channel.
    pub fn current(&self) -> Option<Arc<ActiveChannel>> {
        self.current.read().clone()
    }

    /// Wait up to `wait` for a channel to be installed.
    ///
    /// Returns immediately when one is current. Fails with
    /// [`GatewayError::NoChannel`] on shutdown or when `wait` elapses.
    pub async fn acquire(&self, wait: Duration) -> Result<Arc<ActiveChannel>, GatewayError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking, so an install in between is not missed.
            let installed = self.installed.notified();

            if self.is_shutting_down() {
                return Err(GatewayError::NoChannel);
            }
            if let Some(active) = self.current() {
                return Ok(active);
            }
            if tokio::time::timeout_at(deadline, installed).await.is_err() {
                return Err(GatewayError::NoChannel);
            }
        }
    }

    /// Uninstall `active` if it is still current.
    ///
    /// Called when a call observes that the channel was closed under it, so
    /// later calls wait for the replacement instead of using a dead channel.
    pub fn retire(&self, active: &Arc<ActiveChannel>) {
        let mut current = self.current.write();
        if current
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, active))
        {
            *current = None;
            debug!(channel_id = active.id(), "Channel retired");
        }
    }

    /// Number of times the channel has been replaced.
    pub fn recreations(&self) -> u64 {
        self.recreations.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        *self.current.write() = None;
        self.installed.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Open a channel on the connection and prepare it.
    pub async fn open(&self, reason: &str) -> Result<ChannelEvents, GatewayError> {
        let opened = self
            .connection
            .open_channel()
            .await
            .map_err(|source| GatewayError::ChannelSetup {
                reason: reason.to_string(),
                source,
            })?;
        self.prepare_channel(opened, reason).await
    }

    /// Declare the reply queue on a fresh channel, start consuming it and
    /// install the channel as current (with no bindings).
    ///
    /// Returns the channel's event stream for the event loop.
    pub async fn prepare_channel(
        &self,
        opened: OpenedChannel,
        reason: &str,
    ) -> Result<ChannelEvents, GatewayError> {
        let OpenedChannel { channel, events } = opened;
        let setup_error = |source: BusError| GatewayError::ChannelSetup {
            reason: reason.to_string(),
            source,
        };

        let reply_queue = channel.declare_reply_queue().await.map_err(setup_error)?;
        channel.consume(&reply_queue).await.map_err(setup_error)?;

        info!(
            channel_id = channel.id(),
            reply_queue = %reply_queue,
            reason = reason,
            "Channel ready"
        );

        *self.current.write() = Some(Arc::new(ActiveChannel::new(channel, reply_queue)));
        self.installed.notify_waiters();

        Ok(events)
    }

    /// Process channel events until supervision ends.
    ///
    /// Returns `Ok(())` when the stream ends during shutdown, and the fatal
    /// error otherwise.
    pub async fn run(&self, mut events: ChannelEvents) -> Result<(), GatewayError> {
        loop {
            let Some(event) = events.recv().await else {
                if self.is_shutting_down() {
                    debug!("Channel event stream closed");
                    return Ok(());
                }
                return Err(GatewayError::ChannelFault {
                    channel_id: self.current_id(),
                    source: BusError::ChannelClosed,
                });
            };

            match event {
                ChannelEvent::Delivery(message) => self.handle_reply(message),
                ChannelEvent::Returned(message) => self.handle_return(message),
                ChannelEvent::Fault(err) => {
                    let channel_id = self.current_id();
                    *self.current.write() = None;

                    if self.is_shutting_down() {
                        debug!(channel_id = channel_id, error = %err, "Channel closed during shutdown");
                        return Ok(());
                    }
                    if !err.is_not_found() {
                        return Err(GatewayError::ChannelFault {
                            channel_id,
                            source: err,
                        });
                    }

                    warn!(channel_id = channel_id, error = %err, "Channel closed by broker, reopening");
                    self.recreations.fetch_add(1, Ordering::Relaxed);
                    events = self.open(&err.to_string()).await?;
                }
            }
        }
    }

    fn current_id(&self) -> u16 {
        self.current.read().as_ref().map_or(0, |active| active.id())
    }

    /// A delivery on the reply queue.
    fn handle_reply(&self, message: InboundMessage) {
        let Some(correlation_id) = parse_correlation_id(&message) else {
            debug!(
                exchange = %message.exchange,
                "Ignoring reply without a usable correlation id"
            );
            return;
        };

        let InboundMessage {
            body, properties, ..
        } = message;
        let content_type = properties.content_type.unwrap_or_default();

        if !self
            .table
            .resolve(&correlation_id, RpcResult::ok(body, content_type))
        {
            debug!(correlation_id = %correlation_id, "Ignoring late or unknown reply");
        }
    }

    /// A request the broker could not route.
    fn handle_return(&self, message: InboundMessage) {
        let Some(correlation_id) = parse_correlation_id(&message) else {
            return;
        };

        if self
            .table
            .resolve(&correlation_id, RpcResult::routing_failure())
        {
            warn!(
                correlation_id = %correlation_id,
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Request not routed"
            );
        } else {
            trace!(correlation_id = %correlation_id, "Return for unknown call");
        }
    }
}

fn parse_correlation_id(message: &InboundMessage) -> Option<CorrelationId> {
    message
        .correlation_id()
        .and_then(|raw| CorrelationId::parse(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RpcStatus;
    use shared_bus::{BusConnector, ConnectionParams, ExchangeKind, InMemoryBroker, MessageProperties};

    async fn supervisor(broker: &InMemoryBroker) -> (Arc<ChannelSupervisor>, ChannelEvents) {
        let connected = broker.connect(&ConnectionParams::default()).await.unwrap();
        let table = Arc::new(CorrelationTable::new());
        let supervisor = Arc::new(ChannelSupervisor::new(connected.connection, table));
        let events = supervisor.open("startup").await.unwrap();
        (supervisor, events)
    }

    #[tokio::test]
    async fn test_prepare_installs_channel() {
        let broker = InMemoryBroker::new();
        let (supervisor, _events) = supervisor(&broker).await;

        let active = supervisor.current().unwrap();
        assert!(active.reply_queue().starts_with(shared_bus::GENERATED_QUEUE_PREFIX));
        assert!(broker.queue_exists(active.reply_queue()));
        assert_eq!(broker.open_channels(), vec![active.id()]);
    }

    #[tokio::test]
    async fn test_ensure_bound_once() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("echoResponse", ExchangeKind::Direct);
        let (supervisor, _events) = supervisor(&broker).await;

        let active = supervisor.current().unwrap();
        assert!(!active.is_bound("echoResponse"));
        active.ensure_bound("echoResponse").await.unwrap();
        active.ensure_bound("echoResponse").await.unwrap();

        assert!(active.is_bound("echoResponse"));
        assert!(broker.is_bound(active.reply_queue(), "echoResponse"));
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_call() {
        let broker = InMemoryBroker::new();
        let (supervisor, events) = supervisor(&broker).await;
        let table = Arc::clone(&supervisor.table);
        let active = supervisor.current().unwrap();

        let (id, rx) = table.register("echo");
        let runner = Arc::clone(&supervisor);
        tokio::spawn(async move { runner.run(events).await });

        broker
            .publish(
                "",
                active.reply_queue(),
                "pong",
                MessageProperties::new()
                    .with_correlation_id(id.to_string())
                    .with_content_type("text/plain"),
            )
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(result.status, RpcStatus::Ok);
        assert_eq!(&result.payload[..], b"pong");
        assert_eq!(result.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_reply_without_content_type() {
        let broker = InMemoryBroker::new();
        let (supervisor, events) = supervisor(&broker).await;
        let table = Arc::clone(&supervisor.table);
        let active = supervisor.current().unwrap();

        let (id, rx) = table.register("echo");
        let runner = Arc::clone(&supervisor);
        tokio::spawn(async move { runner.run(events).await });

        broker
            .publish(
                "",
                active.reply_queue(),
                "raw",
                MessageProperties::new().with_correlation_id(id.to_string()),
            )
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(result.content_type, "");
    }

    #[tokio::test]
    async fn test_not_found_fault_reopens_channel() {
        let broker = InMemoryBroker::new();
        let (supervisor, events) = supervisor(&broker).await;
        let first = supervisor.current().unwrap();

        let runner = Arc::clone(&supervisor);
        tokio::spawn(async move { runner.run(events).await });

        assert!(first.channel().check_exchange("nowhere").await.is_err());

        let second = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(active) = supervisor.current() {
                    if active.id() != first.id() {
                        return active;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timeout");

        assert_ne!(second.reply_queue(), first.reply_queue());
        assert!(!broker.queue_exists(first.reply_queue()));
        assert_eq!(supervisor.recreations(), 1);
    }

    #[tokio::test]
    async fn test_other_fault_is_fatal() {
        let broker = InMemoryBroker::new();
        let (supervisor, events) = supervisor(&broker).await;
        let channel_id = supervisor.current().unwrap().id();

        broker.inject_channel_fault(channel_id, BusError::Protocol("PRECONDITION_FAILED".into()));

        let result = tokio::time::timeout(Duration::from_secs(1), supervisor.run(events))
            .await
            .expect("timeout");
        assert!(matches!(
            result,
            Err(GatewayError::ChannelFault { channel_id: id, .. }) if id == channel_id
        ));
        assert!(supervisor.current().is_none());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_install() {
        let broker = InMemoryBroker::new();
        let (supervisor, _events) = supervisor(&broker).await;
        let active = supervisor.current().unwrap();
        supervisor.retire(&active);
        assert!(supervisor.current().is_none());

        let waiter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.acquire(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let _events = supervisor.open("test").await.unwrap();
        let acquired = waiter.await.unwrap().unwrap();
        assert_ne!(acquired.id(), active.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up() {
        let broker = InMemoryBroker::new();
        let (supervisor, _events) = supervisor(&broker).await;
        let active = supervisor.current().unwrap();
        supervisor.retire(&active);

        let result = supervisor.acquire(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(GatewayError::NoChannel)));
    }
}
