//! Call protocol: check, bind, register, publish, await, resolve once.

use crate::domain::correlation::CorrelationId;
use crate::domain::error::GatewayError;
use crate::domain::pending::CorrelationTable;
use crate::domain::types::{RpcRequest, RpcResult};
use crate::ipc::supervisor::{ActiveChannel, ChannelSupervisor};
use crate::ports::TimeSource;
use shared_bus::{BusError, MessageProperties};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Issues calls over the current channel.
pub struct RpcHandler {
    channels: Arc<ChannelSupervisor>,
    table: Arc<CorrelationTable>,
    clock: Arc<dyn TimeSource>,
    /// Stamped on every request as `user_id`; the broker rejects a
    /// mismatch with the connection's login.
    user_id: String,
}

/// Removes the call's entry if the caller stops waiting.
///
/// A no-op once the call has been resolved.
struct CallGuard<'a> {
    table: &'a CorrelationTable,
    correlation_id: CorrelationId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.table.cancel(&self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "Call abandoned by caller");
        }
    }
}

/// How a bus failure during a call is reported.
enum Failure {
    /// The channel was closed under the call; try again on its replacement.
    ChannelLost(BusError),
    /// The connection is gone; the call has no usable channel.
    Unavailable(BusError),
    /// Any other failure, reported as the call's result.
    Call(BusError),
}

/// Outcome of one attempt to get a request onto the bus.
enum Attempt {
    Published,
    Resolved(RpcResult),
    Retry(BusError),
}

/// A registered call: its id, the receiving end and the cancel guard.
type Registration<'a> = (CorrelationId, oneshot::Receiver<RpcResult>, CallGuard<'a>);

impl RpcHandler {
    pub fn new(
        channels: Arc<ChannelSupervisor>,
        table: Arc<CorrelationTable>,
        clock: Arc<dyn TimeSource>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            channels,
            table,
            clock,
            user_id: user_id.into(),
        }
    }

    /// Perform one call.
    ///
    /// Every per-call outcome is an [`RpcResult`]. `Err` means no usable
    /// channel was available for the call. A channel closed before the
    /// request was published is replaced and the call goes out on the new one.
    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResult, GatewayError> {
        // The whole call, including waiting for a channel, is bounded by the timeout.
        let deadline = Instant::now() + request.timeout;
        let mut registration = None;

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let active = self.channels.acquire(wait).await?;

            match self.attempt(request, &active, &mut registration).await? {
                Attempt::Resolved(result) => return Ok(result),
                Attempt::Retry(err) => {
                    debug!(
                        channel_id = active.id(),
                        error = %err,
                        "Channel closed before publish, retrying on its replacement"
                    );
                }
                Attempt::Published => break,
            }
        }

        match registration {
            Some((correlation_id, rx, _guard)) => {
                Ok(self.await_result(correlation_id, rx, deadline).await)
            }
            None => Err(GatewayError::NoChannel),
        }
    }

    /// Check, bind and publish on `active`.
    ///
    /// The call is registered on first reaching the publish and keeps its
    /// correlation id across retries.
    async fn attempt<'a>(
        &'a self,
        request: &RpcRequest,
        active: &Arc<ActiveChannel>,
        registration: &mut Option<Registration<'a>>,
    ) -> Result<Attempt, GatewayError> {
        for exchange in [&request.request_exchange, &request.response_exchange] {
            if let Err(err) = active.channel().check_exchange(exchange).await {
                return match self.classify(active, err) {
                    Failure::Call(err) if err.is_not_found() => {
                        debug!(exchange = %exchange, "Exchange not found");
                        Ok(Attempt::Resolved(RpcResult::not_found(exchange)))
                    }
                    Failure::ChannelLost(err) => Ok(Attempt::Retry(err)),
                    Failure::Call(err) | Failure::Unavailable(err) => Err(GatewayError::Bus(err)),
                };
            }
        }

        if let Err(err) = active.ensure_bound(&request.response_exchange).await {
            return match self.classify(active, err) {
                Failure::ChannelLost(err) => Ok(Attempt::Retry(err)),
                Failure::Unavailable(err) => Err(GatewayError::Bus(err)),
                Failure::Call(err) => {
                    warn!(
                        exchange = %request.response_exchange,
                        error = %err,
                        "Failed to bind reply queue"
                    );
                    Ok(Attempt::Resolved(RpcResult::bind_failure(
                        &request.response_exchange,
                    )))
                }
            };
        }

        let (correlation_id, _, _) = registration.get_or_insert_with(|| {
            let command = request
                .request_exchange
                .strip_suffix(crate::domain::types::REQUEST_EXCHANGE_SUFFIX)
                .unwrap_or(&request.request_exchange);
            let (correlation_id, rx) = self.table.register(command);
            let guard = CallGuard {
                table: &self.table,
                correlation_id,
            };
            (correlation_id, rx, guard)
        });
        let correlation_id = *correlation_id;

        let properties = MessageProperties::new()
            .with_reply_to(active.reply_queue())
            .with_correlation_id(correlation_id.to_string())
            .with_content_type(request.content_type.as_str())
            .with_timestamp(self.clock.now())
            .with_kind(request.request_exchange.as_str())
            .with_user_id(self.user_id.as_str());

        if let Err(err) = active
            .channel()
            .publish(
                &request.request_exchange,
                &request.routing_key,
                request.body.clone(),
                properties,
            )
            .await
        {
            return match self.classify(active, err) {
                // Deleted between the check and the publish.
                Failure::Call(err) if err.is_not_found() => {
                    Ok(Attempt::Resolved(RpcResult::not_found(&request.request_exchange)))
                }
                Failure::ChannelLost(err) => Ok(Attempt::Retry(err)),
                Failure::Call(err) | Failure::Unavailable(err) => Err(GatewayError::Bus(err)),
            };
        }

        debug!(
            correlation_id = %correlation_id,
            exchange = %request.request_exchange,
            routing_key = %request.routing_key,
            channel_id = active.id(),
            "Published request"
        );

        Ok(Attempt::Published)
    }

    /// Wait for the call's resolution, or time it out.
    async fn await_result(
        &self,
        correlation_id: CorrelationId,
        mut rx: oneshot::Receiver<RpcResult>,
        deadline: Instant,
    ) -> RpcResult {
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            // Only a cancel drops the sender, and only our own guard cancels.
            Ok(Err(_)) => RpcResult::timeout(),
            Err(_) => {
                if self.table.expire(&correlation_id) {
                    warn!(correlation_id = %correlation_id, "Request timed out");
                    RpcResult::timeout()
                } else {
                    // A resolver removed the entry first; its result is in flight.
                    rx.await.unwrap_or_else(|_| RpcResult::timeout())
                }
            }
        }
    }

    /// Sort a failure, retiring the channel when it has been closed.
    fn classify(&self, active: &Arc<ActiveChannel>, err: BusError) -> Failure {
        match err {
            BusError::ChannelClosed => {
                self.channels.retire(active);
                Failure::ChannelLost(err)
            }
            BusError::ConnectionClosed => {
                self.channels.retire(active);
                Failure::Unavailable(err)
            }
            BusError::NotFound(_) => {
                // The broker closes the channel on a not-found error.
                self.channels.retire(active);
                Failure::Call(err)
            }
            other => Failure::Call(other),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }
}
