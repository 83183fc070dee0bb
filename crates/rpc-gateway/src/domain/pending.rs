//! Correlation Table - maps correlation IDs to calls awaiting a reply.
//!
//! Three sources race to finish a call: the reply handler, the return
//! handler and the call's own timer. Whichever removes the entry first owns
//! the resolution; the others find nothing and do nothing.

use crate::domain::correlation::CorrelationId;
use crate::domain::types::{RpcResult, RpcStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// A call waiting for its result.
struct PendingCall {
    /// Single-use resolver
    sender: oneshot::Sender<RpcResult>,
    /// When the call was registered
    created_at: Instant,
    /// Command name (for logging)
    command: String,
}

/// Counters for the correlation table.
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Calls registered
    pub total_registered: AtomicU64,
    /// Calls resolved by a reply
    pub total_completed: AtomicU64,
    /// Calls resolved by a returned (unroutable) request
    pub total_returned: AtomicU64,
    /// Calls resolved by their timer
    pub total_timeouts: AtomicU64,
    /// Calls abandoned by their caller
    pub total_cancelled: AtomicU64,
}

/// Point-in-time copy of [`PendingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingStatsSnapshot {
    pub registered: u64,
    pub completed: u64,
    pub returned: u64,
    pub timeouts: u64,
    pub cancelled: u64,
}

impl PendingStats {
    pub fn snapshot(&self) -> PendingStatsSnapshot {
        PendingStatsSnapshot {
            registered: self.total_registered.load(Ordering::Relaxed),
            completed: self.total_completed.load(Ordering::Relaxed),
            returned: self.total_returned.load(Ordering::Relaxed),
            timeouts: self.total_timeouts.load(Ordering::Relaxed),
            cancelled: self.total_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Outstanding calls, keyed by correlation ID.
///
/// Flow:
/// 1. The call protocol calls `register()` and publishes with the returned ID
/// 2. A reply or a return calls `resolve()`
/// 3. The caller awaits the receiver; on timeout it calls `expire()`
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<CorrelationId, PendingCall>,
    stats: PendingStats,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and get the receiver its result will arrive on.
    pub fn register(&self, command: &str) -> (CorrelationId, oneshot::Receiver<RpcResult>) {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingCall {
                sender: tx,
                created_at: Instant::now(),
                command: command.to_string(),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        trace!(correlation_id = %correlation_id, command = command, "Registered call");

        (correlation_id, rx)
    }

    /// Resolve a call with `result`.
    ///
    /// Returns false if the call is unknown or already resolved.
    pub fn resolve(&self, correlation_id: &CorrelationId, result: RpcResult) -> bool {
        let Some((_, call)) = self.pending.remove(correlation_id) else {
            return false;
        };

        let status = result.status;
        match status {
            RpcStatus::RoutingFailure => {
                self.stats.total_returned.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            correlation_id = %correlation_id,
            command = %call.command,
            status = %status,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "Resolved call"
        );

        // The caller may have gone away between our remove and this send.
        let _ = call.sender.send(result);
        true
    }

    /// Remove a call whose timer fired.
    ///
    /// Returns false if another source resolved it first, in which case its
    /// result is already on the way to the receiver.
    pub fn expire(&self, correlation_id: &CorrelationId) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, call)) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    command = %call.command,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "Call timed out"
                );
                true
            }
            None => false,
        }
    }

    /// Drop a call without resolving it.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of outstanding calls
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = CorrelationTable::new();

        let (id, rx) = table.register("echo");
        assert!(table.is_pending(&id));
        assert_eq!(table.pending_count(), 1);

        assert!(table.resolve(&id, RpcResult::ok("hello", "text/plain")));

        let result = rx.await.unwrap();
        assert_eq!(result.status, RpcStatus::Ok);
        assert_eq!(&result.payload[..], b"hello");
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(&CorrelationId::new(), RpcResult::routing_failure()));
        assert_eq!(table.stats().snapshot(), PendingStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_resolves_once() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register("echo");

        assert!(table.resolve(&id, RpcResult::routing_failure()));
        assert!(!table.resolve(&id, RpcResult::ok("late", "text/plain")));
        assert!(!table.expire(&id));

        assert_eq!(rx.await.unwrap().status, RpcStatus::RoutingFailure);
        let stats = table.stats().snapshot();
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test]
    async fn test_expire() {
        let table = CorrelationTable::new();
        let (id, _rx) = table.register("echo");

        assert!(table.expire(&id));
        assert!(!table.is_pending(&id));
        assert!(!table.resolve(&id, RpcResult::ok("late", "text/plain")));
        assert_eq!(table.stats().snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let table = CorrelationTable::new();

        let (id, _rx) = table.register("echo");
        assert!(table.cancel(&id));
        assert!(!table.is_pending(&id));

        // Cancel again should return false
        assert!(!table.cancel(&id));
        assert_eq!(table.stats().snapshot().cancelled, 1);
    }

    #[tokio::test]
    async fn test_resolve_after_receiver_dropped() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register("echo");
        drop(rx);

        assert!(table.resolve(&id, RpcResult::ok("x", "text/plain")));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolvers_single_winner() {
        let table = Arc::new(CorrelationTable::new());

        for _ in 0..100 {
            let (id, rx) = table.register("echo");

            let mut handles = Vec::new();
            for n in 0..4 {
                let table = Arc::clone(&table);
                handles.push(tokio::spawn(async move {
                    if n == 0 {
                        table.expire(&id)
                    } else {
                        table.resolve(&id, RpcResult::ok(format!("{}", n), "text/plain"))
                    }
                }));
            }

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            drop(rx);
        }

        let stats = table.stats().snapshot();
        assert_eq!(stats.completed + stats.timeouts, 100);
        assert_eq!(table.pending_count(), 0);
    }
}
