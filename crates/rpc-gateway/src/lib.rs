// Allow missing docs for internal items in development
#![allow(missing_docs)]

//! RPC Gateway - synchronous request/response over an AMQP message bus.
//!
//! A caller names a command; the gateway publishes the request to the
//! `<command>Request` exchange, waits for the correlated reply on its
//! reply queue (bound to `<command>Response`) and hands back exactly one
//! result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            RPC GATEWAY                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  HTTP  POST /rpc/:command      GET /health  /pending  /metrics      │
//! │         │                                                           │
//! │  ┌──────┴──────────────────────────────┐                            │
//! │  │ RpcHandler (call protocol)          │                            │
//! │  │ check → bind → register → publish   │                            │
//! │  └──────┬───────────────────┬──────────┘                            │
//! │         │                   │                                       │
//! │  ┌──────┴──────────┐  ┌─────┴──────────────────────────────┐        │
//! │  │ Correlation     │←─│ ChannelSupervisor (event loop)     │        │
//! │  │ Table (oneshot) │  │ reply / return / fault → reopen    │        │
//! │  └─────────────────┘  └─────┬──────────────────────────────┘        │
//! │                             │                                       │
//! │                    ConnectionSupervisor                             │
//! └─────────────────────────────┼───────────────────────────────────────┘
//!                               │
//!                          Message bus
//!                               │
//!              <command>Request → worker → <command>Response
//! ```
//!
//! # Outcomes
//!
//! | Status         | Code | Cause                                   |
//! |----------------|------|-----------------------------------------|
//! | Ok             | 200  | correlated reply received               |
//! | NotFound       | 404  | request or response exchange missing    |
//! | RoutingFailure | 404  | request returned as unroutable          |
//! | BindFailure    | 500  | reply queue could not be bound          |
//! | Timeout        | 504  | no reply before the call's timeout      |
//!
//! # Usage
//!
//! ```ignore
//! use rpc_gateway::{GatewayConfig, RpcGateway};
//! use shared_bus::AmqpConnector;
//!
//! let gateway = RpcGateway::connect(GatewayConfig::default(), &AmqpConnector).await?;
//! let result = gateway.call("echo", "", "hello".into(), "text/plain", None).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod domain;
pub mod ipc;
pub mod middleware;
pub mod ports;
pub mod service;

// Re-exports for public API
pub use domain::config::{ConfigError, GatewayConfig, LogLevel};
pub use domain::error::GatewayError;
pub use domain::pending::{CorrelationTable, PendingStatsSnapshot};
pub use domain::types::*;
pub use domain::CorrelationId;
pub use ipc::{ChannelSupervisor, ConnectionSupervisor, RpcHandler};
pub use middleware::GatewayMetrics;
pub use service::{RpcGateway, DEFAULT_CONTENT_TYPE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
