//! # RPC Gateway Runtime
//!
//! Entry point for the gateway binary. See the library docs for the startup
//! sequence and exit codes.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info};

use gateway_runtime::{init_logging, load_config, EXIT_DISCONNECT_FAILED, EXIT_SHUTDOWN};
use rpc_gateway::{GatewayConfig, RpcGateway, VERSION};
use shared_bus::AmqpConnector;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the file, so it is not up yet.
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::from(EXIT_SHUTDOWN);
        }
    };

    if let Err(e) = init_logging(config.log_level) {
        eprintln!("{:#}", e);
        return ExitCode::from(EXIT_SHUTDOWN);
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Gateway terminated");
            ExitCode::from(EXIT_SHUTDOWN)
        }
    }
}

/// Serve until interrupted or a fatal bus fault.
async fn run(config: GatewayConfig) -> Result<ExitCode> {
    info!("===========================================");
    info!("  RPC Gateway v{}", VERSION);
    info!("===========================================");

    let gateway = Arc::new(
        RpcGateway::connect(config, &AmqpConnector)
            .await
            .context("Failed to start gateway")?,
    );
    let listener = gateway.bind().await.context("Failed to bind HTTP listener")?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(Arc::clone(&gateway).serve(listener, async move {
        let _ = stop_rx.await;
    }));

    info!("Gateway is running. Press Ctrl+C to stop.");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Interrupt received, shutting down");
            let _ = stop_tx.send(());

            match gateway.shutdown().await {
                Ok(()) => {
                    info!("Disconnected from message bus");
                    Ok(ExitCode::from(EXIT_SHUTDOWN))
                }
                Err(e) => {
                    error!(error = %e, "Failed to close message bus connection");
                    Ok(ExitCode::from(EXIT_DISCONNECT_FAILED))
                }
            }
        }
        fatal = gateway.fatal() => {
            Err(anyhow::Error::new(fatal).context("Fatal message bus fault"))
        }
        served = &mut server => {
            served
                .context("HTTP server task panicked")?
                .context("HTTP server failed")?;
            anyhow::bail!("HTTP server stopped unexpectedly")
        }
    }
}
