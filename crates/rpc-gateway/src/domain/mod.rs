//! Domain types for the RPC Gateway.
//!
//! Core types, configuration, error handling and the correlation table.

pub mod config;
pub mod correlation;
pub mod error;
pub mod pending;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigError, GatewayConfig, LogLevel};
pub use correlation::CorrelationId;
pub use error::GatewayError;
pub use pending::{CorrelationTable, PendingStats, PendingStatsSnapshot};
pub use types::*;
