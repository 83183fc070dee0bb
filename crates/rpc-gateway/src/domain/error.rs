//! Gateway error types.
//!
//! Per-call outcomes (missing exchange, bind failure, unroutable request,
//! timeout) are not errors: they are encoded in [`RpcResult`]. These errors
//! cover setup, supervision and "no usable channel" conditions.
//!
//! [`RpcResult`]: crate::domain::types::RpcResult

use crate::domain::config::ConfigError;
use shared_bus::BusError;

/// Gateway-level errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Initial connection to the bus failed
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: BusError,
    },

    /// Opening or preparing a channel failed
    #[error("failed to set up channel ({reason}): {source}")]
    ChannelSetup {
        reason: String,
        #[source]
        source: BusError,
    },

    /// No channel is installed
    #[error("no usable channel")]
    NoChannel,

    /// A bus operation failed during a call
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// The channel failed in a way that cannot be recovered
    #[error("channel {channel_id} failed: {source}")]
    ChannelFault {
        channel_id: u16,
        #[source]
        source: BusError,
    },

    /// The connection failed
    #[error("connection failed: {0}")]
    ConnectionFault(BusError),

    /// Closing the connection failed
    #[error("failed to disconnect: {0}")]
    Disconnect(BusError),

    /// Server socket bind error
    #[error("server bind error: {0}")]
    Bind(String),
}
