//! RPC Gateway service - wires the bus side to the HTTP front end.
//!
//! Routes:
//! - `POST /rpc/:command` - perform a call (`routing_key`, `timeout` in ms as query)
//! - `GET /` - banner
//! - `GET|POST /health` - liveness
//! - `GET /pending` - correlation table counters
//! - `GET /metrics` - call counters

use crate::domain::config::GatewayConfig;
use crate::domain::error::GatewayError;
use crate::domain::pending::{CorrelationTable, PendingStatsSnapshot};
use crate::domain::types::{RpcRequest, RpcResult};
use crate::ipc::{ChannelSupervisor, ConnectionSupervisor, RpcHandler};
use crate::middleware::{GatewayMetrics, RequestTimer, TracingLayer};
use crate::ports::SystemTimeSource;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use shared_bus::BusConnector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

/// Content type assumed when a caller sends none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// The gateway: connection, channel, correlation table and call protocol.
pub struct RpcGateway {
    config: GatewayConfig,
    table: Arc<CorrelationTable>,
    supervisor: ConnectionSupervisor,
    handler: RpcHandler,
    metrics: Arc<GatewayMetrics>,
}

impl RpcGateway {
    /// Validate `config`, connect to the bus and prepare the first channel.
    pub async fn connect(
        config: GatewayConfig,
        connector: &dyn BusConnector,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let table = Arc::new(CorrelationTable::new());
        let supervisor =
            ConnectionSupervisor::connect(connector, &config.connection_params(), Arc::clone(&table))
                .await?;
        let handler = RpcHandler::new(
            Arc::clone(supervisor.channels()),
            Arc::clone(&table),
            Arc::new(SystemTimeSource),
            config.bus.login.clone(),
        );

        Ok(Self {
            config,
            table,
            supervisor,
            handler,
            metrics: Arc::new(GatewayMetrics::new()),
        })
    }

    /// Call `command` and wait for its result.
    ///
    /// A missing or zero `timeout` uses the configured default.
    pub async fn call(
        &self,
        command: &str,
        routing_key: &str,
        body: Bytes,
        content_type: &str,
        timeout: Option<Duration>,
    ) -> Result<RpcResult, GatewayError> {
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.timeouts.rpc);
        let request = RpcRequest::for_command(command, body, content_type)
            .with_routing_key(routing_key)
            .with_timeout(timeout);

        let timer = RequestTimer::new(Arc::clone(&self.metrics));
        let result = self.handler.call(&request).await;
        timer.finish(result.as_ref().ok().map(|r| r.status));
        result
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<ChannelSupervisor> {
        self.supervisor.channels()
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }

    pub fn stats(&self) -> PendingStatsSnapshot {
        self.table.stats().snapshot()
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Resolves with the first fatal bus error.
    pub async fn fatal(&self) -> GatewayError {
        self.supervisor.fatal().await
    }

    /// Close the bus connection.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.supervisor.shutdown().await
    }

    /// Bind the configured HTTP address.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = self.config.http_addr();
        TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{}: {}", addr, e)))
    }

    /// Serve HTTP on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Starting HTTP server");
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::Bind(e.to_string()))
    }

    /// Build the HTTP router
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(banner))
            .route("/health", get(health_check).post(health_check))
            .route("/rpc/:command", post(handle_rpc))
            .route("/pending", get(pending))
            .route("/metrics", get(metrics))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.config.limits.max_request_size))
            .layer(TracingLayer::new())
            .with_state(Arc::clone(self))
    }
}

/// Query parameters of `POST /rpc/:command`.
#[derive(Debug, Default, Deserialize)]
struct RpcParams {
    routing_key: Option<String>,
    /// Milliseconds; kept as text so a malformed value falls back to the default.
    timeout: Option<String>,
}

impl RpcParams {
    fn timeout(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}

async fn handle_rpc(
    State(gateway): State<Arc<RpcGateway>>,
    Path(command): Path<String>,
    Query(params): Query<RpcParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let routing_key = params.routing_key.as_deref().unwrap_or("");

    match gateway
        .call(&command, routing_key, body, content_type, params.timeout())
        .await
    {
        Ok(result) => rpc_response(result),
        Err(err) => {
            warn!(command = %command, error = %err, "Call failed");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

fn rpc_response(result: RpcResult) -> Response {
    let status =
        StatusCode::from_u16(result.status.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, result.payload).into_response();
    if !result.content_type.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&result.content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    response
}

async fn banner() -> impl IntoResponse {
    format!("RPC Gateway v{}", crate::VERSION)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn pending(State(gateway): State<Arc<RpcGateway>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "count": gateway.pending_count(),
        "stats": gateway.stats(),
    }))
}

async fn metrics(State(gateway): State<Arc<RpcGateway>>) -> impl IntoResponse {
    Json(gateway.metrics.to_json())
}
