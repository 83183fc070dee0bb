//! # Bus Errors

use thiserror::Error;

/// Errors reported by the bus, either as the result of an operation or as an
/// asynchronous channel/connection fault.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// An operation referenced an exchange or queue that does not exist.
    ///
    /// The broker closes the channel on which this happened.
    #[error("not found: {0}")]
    NotFound(String),

    /// The broker refused the operation.
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The channel is no longer usable.
    #[error("channel closed")]
    ChannelClosed,

    /// The connection is no longer usable.
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other protocol-level error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl BusError {
    /// Whether this is a "not found" class fault.
    ///
    /// A channel closed for this reason can be replaced by a fresh channel on
    /// the same connection.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, BusError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(BusError::NotFound("no exchange 'x'".into()).is_not_found());
        assert!(!BusError::AccessRefused("x".into()).is_not_found());
        assert!(!BusError::ChannelClosed.is_not_found());
        assert!(!BusError::Io("reset".into()).is_not_found());
    }

    #[test]
    fn test_display() {
        let err = BusError::NotFound("no exchange 'fooRequest' in vhost '/'".into());
        assert_eq!(
            err.to_string(),
            "not found: no exchange 'fooRequest' in vhost '/'"
        );
    }
}
