//! Request spans for the HTTP front end.
//!
//! Every request runs inside a `gateway_request` span carrying the method,
//! path, the called command (for `/rpc/:command`) and, once known, the
//! response status and elapsed time.

use axum::{body::Body, http::Request, response::Response};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::{field::Empty, info_span, Instrument, Span};

/// Wraps each request in a `gateway_request` span.
#[derive(Clone, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let span = request_span(&req);

        Box::pin(
            async move {
                let started = Instant::now();
                let result = inner.call(req).await;

                let span = Span::current();
                span.record("elapsed_ms", started.elapsed().as_millis() as u64);
                match &result {
                    Ok(response) => {
                        let status = response.status();
                        span.record("http.status_code", status.as_u16());
                        span.record(
                            "otel.status_code",
                            if status.is_success() { "OK" } else { "ERROR" },
                        );
                    }
                    Err(_) => {
                        span.record("otel.status_code", "ERROR");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

fn request_span(req: &Request<Body>) -> Span {
    let path = req.uri().path();
    let span = info_span!(
        "gateway_request",
        http.method = %req.method(),
        http.target = %path,
        rpc.command = Empty,
        http.status_code = Empty,
        otel.status_code = Empty,
        elapsed_ms = Empty,
    );

    if let Some(command) = rpc_command(path) {
        span.record("rpc.command", command);
    }
    if let Some(parent) = TraceParent::from_request(req) {
        span.follows_from(parent.span());
    }
    span
}

/// Command name from a `/rpc/<command>` path.
fn rpc_command(path: &str) -> Option<&str> {
    path.strip_prefix("/rpc/")
        .filter(|command| !command.is_empty() && !command.contains('/'))
}

/// W3C `traceparent` header: `version-trace_id-parent_id-flags`.
#[derive(Debug, PartialEq, Eq)]
struct TraceParent<'a> {
    trace_id: &'a str,
    parent_id: &'a str,
}

impl<'a> TraceParent<'a> {
    fn from_request<B>(req: &'a Request<B>) -> Option<Self> {
        Self::parse(req.headers().get("traceparent")?.to_str().ok()?)
    }

    fn parse(header: &'a str) -> Option<Self> {
        let mut parts = header.split('-');
        let (_version, trace_id, parent_id, _flags) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !hex(trace_id, 32) || !hex(parent_id, 16) {
            return None;
        }

        Some(Self {
            trace_id,
            parent_id,
        })
    }

    fn span(&self) -> Span {
        info_span!(
            "parent_trace",
            trace_id = self.trace_id,
            parent_span_id = self.parent_id
        )
    }
}
