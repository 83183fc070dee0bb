//! Request and result types for gateway calls.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shared_bus::TEXT_PLAIN;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Timeout applied when the caller gives none (or an unusable one).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);

/// Suffix of the exchange a command's requests are published to.
pub const REQUEST_EXCHANGE_SUFFIX: &str = "Request";

/// Suffix of the exchange a command's replies are published to.
pub const RESPONSE_EXCHANGE_SUFFIX: &str = "Response";

/// Payload of a call whose request the bus could not route.
pub const NOT_ROUTED_MESSAGE: &str = "request not routed";

/// Payload of a call that received no reply in time.
pub const TIMED_OUT_MESSAGE: &str = "request timed out";

/// Outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcStatus {
    /// A correlated reply arrived.
    Ok,
    /// The request or response exchange does not exist.
    NotFound,
    /// The bus returned the request as unroutable.
    RoutingFailure,
    /// The reply queue could not be bound to the response exchange.
    BindFailure,
    /// No reply arrived before the call's timeout.
    Timeout,
}

impl RpcStatus {
    /// HTTP-equivalent status code.
    pub fn code(&self) -> u16 {
        match self {
            RpcStatus::Ok => 200,
            RpcStatus::NotFound | RpcStatus::RoutingFailure => 404,
            RpcStatus::BindFailure => 500,
            RpcStatus::Timeout => 504,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcStatus::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcStatus::Ok => "ok",
            RpcStatus::NotFound => "not_found",
            RpcStatus::RoutingFailure => "routing_failure",
            RpcStatus::BindFailure => "bind_failure",
            RpcStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single call through the gateway. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Exchange the request is published to.
    pub request_exchange: String,
    /// Exchange the worker publishes its reply to.
    pub response_exchange: String,
    /// Routing key for the request; empty means default routing.
    pub routing_key: String,
    pub body: Bytes,
    /// Opaque to the gateway, forwarded as the message content type.
    pub content_type: String,
    pub timeout: Duration,
}

impl RpcRequest {
    /// Build a request for `command`, which maps to the exchanges
    /// `<command>Request` and `<command>Response`.
    pub fn for_command(
        command: &str,
        body: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            request_exchange: format!("{}{}", command, REQUEST_EXCHANGE_SUFFIX),
            response_exchange: format!("{}{}", command, RESPONSE_EXCHANGE_SUFFIX),
            routing_key: String::new(),
            body: body.into(),
            content_type: content_type.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Set the timeout. A zero duration falls back to [`DEFAULT_RPC_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_RPC_TIMEOUT
        } else {
            timeout
        };
        self
    }
}

/// Result of a call, produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub status: RpcStatus,
    /// Reply body for `Ok`, human-readable text otherwise.
    pub payload: Bytes,
    pub content_type: String,
}

impl RpcResult {
    /// Successful reply.
    pub fn ok(payload: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::Ok,
            payload: payload.into(),
            content_type: content_type.into(),
        }
    }

    /// Exchange missing.
    pub fn not_found(exchange: &str) -> Self {
        Self::text(
            RpcStatus::NotFound,
            format!("exchange '{}' not found", exchange),
        )
    }

    /// Reply queue could not be bound.
    pub fn bind_failure(exchange: &str) -> Self {
        Self::text(
            RpcStatus::BindFailure,
            format!("could not bind reply queue to exchange '{}'", exchange),
        )
    }

    /// Request returned as unroutable.
    pub fn routing_failure() -> Self {
        Self::text(RpcStatus::RoutingFailure, NOT_ROUTED_MESSAGE.to_string())
    }

    /// No reply in time.
    pub fn timeout() -> Self {
        Self::text(RpcStatus::Timeout, TIMED_OUT_MESSAGE.to_string())
    }

    fn text(status: RpcStatus, message: String) -> Self {
        Self {
            status,
            payload: Bytes::from(message),
            content_type: TEXT_PLAIN.to_string(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RpcStatus::Ok.code(), 200);
        assert_eq!(RpcStatus::NotFound.code(), 404);
        assert_eq!(RpcStatus::BindFailure.code(), 500);
        assert_eq!(RpcStatus::RoutingFailure.code(), 404);
        assert_eq!(RpcStatus::Timeout.code(), 504);
    }

    #[test]
    fn test_command_maps_to_exchanges() {
        let request = RpcRequest::for_command("echo", "hello", "text/plain");
        assert_eq!(request.request_exchange, "echoRequest");
        assert_eq!(request.response_exchange, "echoResponse");
        assert_eq!(request.routing_key, "");
        assert_eq!(request.timeout, DEFAULT_RPC_TIMEOUT);
    }

    #[test]
    fn test_zero_timeout_defaults() {
        let request =
            RpcRequest::for_command("echo", "", "text/plain").with_timeout(Duration::ZERO);
        assert_eq!(request.timeout, Duration::from_secs(20));

        let request = RpcRequest::for_command("echo", "", "text/plain")
            .with_timeout(Duration::from_millis(250));
        assert_eq!(request.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_failure_payloads() {
        let result = RpcResult::not_found("missingRequest");
        assert_eq!(result.status, RpcStatus::NotFound);
        assert!(result.payload_text().contains("missingRequest"));
        assert_eq!(result.content_type, "text/plain");

        assert_eq!(RpcResult::routing_failure().payload_text(), "request not routed");
        assert_eq!(RpcResult::timeout().payload_text(), "request timed out");
        assert!(RpcResult::bind_failure("echoResponse")
            .payload_text()
            .contains("echoResponse"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RpcStatus::RoutingFailure).unwrap();
        assert_eq!(json, "\"routing_failure\"");
    }
}
