//! # Bus Client
//!
//! Capability traits the gateway uses to talk to the bus.

use crate::error::BusError;
use crate::message::{ChannelEvent, ConnectionParams, MessageProperties};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of asynchronous events raised on one channel.
///
/// The stream ends when the channel is closed.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Stream of connection-level faults.
pub type ConnectionFaults = mpsc::UnboundedReceiver<BusError>;

/// An established connection and its fault stream.
pub struct Connected {
    pub connection: Arc<dyn BusConnection>,
    pub faults: ConnectionFaults,
}

/// A freshly opened channel and its event stream.
pub struct OpenedChannel {
    pub channel: Arc<dyn BusChannel>,
    pub events: ChannelEvents,
}

/// Establishes connections to the bus.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connect using the given parameters.
    async fn connect(&self, params: &ConnectionParams) -> Result<Connected, BusError>;
}

/// A connection to the bus, multiplexing any number of channels.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Open a new channel.
    async fn open_channel(&self) -> Result<OpenedChannel, BusError>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), BusError>;
}

/// A logical session on a connection.
///
/// A fault on the channel closes it and is reported both as the operation's
/// error and as a [`ChannelEvent::Fault`] on the channel's event stream.
#[async_trait]
pub trait BusChannel: Send + Sync {
    /// Channel number on its connection.
    fn id(&self) -> u16;

    /// Check that an exchange exists (passive declare).
    ///
    /// A missing exchange closes the channel with a "not found" fault.
    async fn check_exchange(&self, exchange: &str) -> Result<(), BusError>;

    /// Declare an anonymous, exclusive, auto-delete, non-durable queue.
    ///
    /// Returns the server-generated queue name.
    async fn declare_reply_queue(&self) -> Result<String, BusError>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BusError>;

    /// Start consuming a queue without acknowledgements.
    ///
    /// Messages arrive as [`ChannelEvent::Delivery`].
    async fn consume(&self, queue: &str) -> Result<(), BusError>;

    /// Publish a mandatory message.
    ///
    /// A message that cannot be routed to any queue comes back as
    /// [`ChannelEvent::Returned`] instead of being dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<(), BusError>;
}
