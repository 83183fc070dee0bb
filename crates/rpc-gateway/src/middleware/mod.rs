//! HTTP middleware for the gateway front end.
//!
//! Layer order: Request → Tracing → BodyLimit → Handler

pub mod metrics;
pub mod tracing;

pub use metrics::{GatewayMetrics, RequestTimer};
pub use tracing::TracingLayer;
