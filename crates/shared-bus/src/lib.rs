//! # Shared Bus - Message Bus Client Capability
//!
//! The gateway talks to the message bus exclusively through the traits in
//! [`client`]. Two implementations are provided:
//!
//! - [`amqp`] - RabbitMQ / AMQP 0-9-1 via `lapin` (feature `amqp`, default)
//! - [`memory`] - a deterministic in-process broker used by tests and local runs
//!
//! ## Model
//!
//! ```text
//! ┌──────────────┐  connect()   ┌───────────────┐  open_channel()  ┌──────────────┐
//! │ BusConnector │ ───────────→ │ BusConnection │ ───────────────→ │  BusChannel  │
//! └──────────────┘              └───────┬───────┘                  └──────┬───────┘
//!                                       │ faults                          │ events
//!                                       ▼                                 ▼
//!                                  BusError                  Delivery / Returned / Fault
//! ```
//!
//! A channel-level fault closes only that channel. Faults are classified by
//! [`BusError::is_not_found`]: "not found" faults are recoverable by opening a
//! new channel, anything else is fatal to the owner of the connection.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod client;
pub mod error;
pub mod memory;
pub mod message;

// Re-export main types
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use client::{
    BusChannel, BusConnection, BusConnector, ChannelEvents, Connected, ConnectionFaults,
    OpenedChannel,
};
pub use error::BusError;
pub use memory::InMemoryBroker;
pub use message::{ChannelEvent, ConnectionParams, ExchangeKind, InboundMessage, MessageProperties};

/// Content type used for all gateway-generated text payloads.
pub const TEXT_PLAIN: &str = "text/plain";

/// Prefix of server-generated queue names.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_queue_prefix() {
        assert!(GENERATED_QUEUE_PREFIX.starts_with("amq."));
    }
}
