//! Correlation ID for matching replies to calls.
//!
//! Uses UUID v7: time-ordered, with 74 random bits per identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Correlation ID placed on a request and echoed on its reply.
///
/// Carried on the bus as the canonical hyphenated string in the message's
/// `correlation_id` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Fresh identifier for a new call.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parse the `correlation_id` property of an inbound message.
    ///
    /// Replies carrying ids the gateway never issued fail here and are dropped.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        s.parse()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s.trim()).map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}
