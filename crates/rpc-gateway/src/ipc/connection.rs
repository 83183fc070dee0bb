//! Connection Supervisor - owns the bus connection.
//!
//! Connects once, never retries. Connection faults and unrecoverable channel
//! faults are published on [`ConnectionSupervisor::fatal`]; deciding what to
//! do about them is left to the runtime.

use crate::domain::error::GatewayError;
use crate::domain::pending::CorrelationTable;
use crate::ipc::supervisor::ChannelSupervisor;
use shared_bus::{BusConnection, BusConnector, ConnectionFaults, ConnectionParams};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Owns the connection and the task supervising it.
pub struct ConnectionSupervisor {
    connection: Arc<dyn BusConnection>,
    channels: Arc<ChannelSupervisor>,
    fatal: watch::Receiver<Option<GatewayError>>,
    task: JoinHandle<()>,
}

impl ConnectionSupervisor {
    /// Connect, prepare the first channel and start supervision.
    pub async fn connect(
        connector: &dyn BusConnector,
        params: &ConnectionParams,
        table: Arc<CorrelationTable>,
    ) -> Result<Self, GatewayError> {
        let connected =
            connector
                .connect(params)
                .await
                .map_err(|source| GatewayError::Connect {
                    target: params.to_string(),
                    source,
                })?;

        info!(bus = %params, "Connected to message bus");

        let connection = connected.connection;
        let channels = Arc::new(ChannelSupervisor::new(Arc::clone(&connection), table));
        let events = channels.open("startup").await?;

        let (fatal_tx, fatal) = watch::channel(None);
        let task = {
            let channels = Arc::clone(&channels);
            let mut faults = connected.faults;
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    outcome = channels.run(events) => outcome,
                    err = next_fault(&mut faults) => Err(err),
                };

                if let Err(err) = outcome {
                    if channels.is_shutting_down() {
                        return;
                    }
                    error!(error = %err, "Message bus supervision failed");
                    fatal_tx.send_replace(Some(err));
                }
            })
        };

        Ok(Self {
            connection,
            channels,
            fatal,
            task,
        })
    }

    pub fn channels(&self) -> &Arc<ChannelSupervisor> {
        &self.channels
    }

    /// Resolves with the first fatal error. Never resolves if none occurs.
    pub async fn fatal(&self) -> GatewayError {
        let mut fatal = self.fatal.clone();
        let err = match fatal.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        match err {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// The fatal error, if one has been raised.
    pub fn fatal_error(&self) -> Option<GatewayError> {
        self.fatal.borrow().clone()
    }

    /// Close the connection gracefully.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.channels.begin_shutdown();
        self.connection
            .close()
            .await
            .map_err(GatewayError::Disconnect)?;
        info!("Disconnected from message bus");
        Ok(())
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Next connection fault. Pending forever once the stream ends.
async fn next_fault(faults: &mut ConnectionFaults) -> GatewayError {
    match faults.recv().await {
        Some(err) => GatewayError::ConnectionFault(err),
        None => std::future::pending().await,
    }
}
