//! # Bus Messages
//!
//! Message, property and event types shared by every bus implementation.

use crate::error::BusError;
use bytes::Bytes;
use std::fmt;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Route on exact routing key match.
    Direct,
    /// Route to every bound queue, ignoring the routing key.
    Fanout,
}

/// Message properties carried alongside a body.
///
/// Only the properties the gateway reads or writes are modelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Queue the receiver should reply to.
    pub reply_to: Option<String>,
    /// Token echoed on the reply.
    pub correlation_id: Option<String>,
    /// MIME type of the body.
    pub content_type: Option<String>,
    /// Unix timestamp in seconds.
    pub timestamp: Option<u64>,
    /// Application message type.
    pub kind: Option<String>,
    /// Identity of the publisher.
    pub user_id: Option<String>,
}

impl MessageProperties {
    /// Create empty properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A message received from the bus (delivered or returned).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Opaque body.
    pub body: Bytes,
    /// Properties set by the publisher.
    pub properties: MessageProperties,
}

impl InboundMessage {
    /// Correlation id, if the publisher set one.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }
}

/// Asynchronous events raised on an open channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A message arrived on a queue this channel consumes.
    Delivery(InboundMessage),
    /// A mandatory message this channel published could not be routed.
    Returned(InboundMessage),
    /// The channel was closed by the broker. No further events follow.
    Fault(BusError),
}

/// Parameters for connecting to the bus.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub hostname: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds (0 disables heartbeats).
    pub heartbeat: u16,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 5672,
            login: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: 30,
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "amqp://{}@{}:{}/{}",
            self.login, self.hostname, self.port, self.vhost
        )
    }
}
