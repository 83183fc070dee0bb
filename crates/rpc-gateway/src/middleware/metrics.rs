//! Call metrics, exported as JSON on `/metrics`.

use crate::domain::types::RpcStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// RPC Gateway metrics
#[derive(Default)]
pub struct GatewayMetrics {
    // Call counters
    pub calls_total: AtomicU64,
    pub calls_ok: AtomicU64,
    pub calls_not_found: AtomicU64,
    pub calls_routing_failure: AtomicU64,
    pub calls_bind_failure: AtomicU64,
    pub calls_timeout: AtomicU64,
    /// Calls that found no usable channel
    pub calls_unavailable: AtomicU64,

    // Latency, summed and worst case
    pub latency_total_ms: AtomicU64,
    pub latency_max_ms: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished call. `None` means the call had no usable channel.
    pub fn record_call(&self, status: Option<RpcStatus>, latency_ms: u64) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let counter = match status {
            Some(RpcStatus::Ok) => &self.calls_ok,
            Some(RpcStatus::NotFound) => &self.calls_not_found,
            Some(RpcStatus::RoutingFailure) => &self.calls_routing_failure,
            Some(RpcStatus::BindFailure) => &self.calls_bind_failure,
            Some(RpcStatus::Timeout) => &self.calls_timeout,
            None => &self.calls_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(latency_ms, Ordering::Relaxed);
    }

    /// Mean call latency in milliseconds, 0 before the first call.
    pub fn average_latency_ms(&self) -> f64 {
        match self.calls_total.load(Ordering::Relaxed) {
            0 => 0.0,
            calls => self.latency_total_ms.load(Ordering::Relaxed) as f64 / calls as f64,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "calls": {
                "total": self.calls_total.load(Ordering::Relaxed),
                "ok": self.calls_ok.load(Ordering::Relaxed),
                "not_found": self.calls_not_found.load(Ordering::Relaxed),
                "routing_failure": self.calls_routing_failure.load(Ordering::Relaxed),
                "bind_failure": self.calls_bind_failure.load(Ordering::Relaxed),
                "timeout": self.calls_timeout.load(Ordering::Relaxed),
                "unavailable": self.calls_unavailable.load(Ordering::Relaxed),
            },
            "latency": {
                "average_ms": self.average_latency_ms(),
                "max_ms": self.latency_max_ms.load(Ordering::Relaxed),
            }
        })
    }
}

/// Measures one call from creation to [`RequestTimer::finish`].
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<GatewayMetrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self, status: Option<RpcStatus>) {
        let latency_ms = self.start.elapsed().as_millis() as u64;
        self.metrics.record_call(status, latency_ms);
    }
}
