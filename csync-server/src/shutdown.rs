//! Signal handling for graceful shutdown.

use csync_core::events::{ShutdownReceiver, ShutdownSender};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;

/// Creates a future that completes when a shutdown signal is received.
///
/// Listens for SIGTERM and SIGINT (Ctrl+C).
pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for SIGINT");
            }
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

/// Spawns a task that flips the shutdown watch once a signal arrives.
pub fn spawn_signal_listener(shutdown_tx: Arc<ShutdownSender>) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    })
}

/// Completes once shutdown has been requested.
pub async fn wait_for_shutdown(mut shutdown_rx: ShutdownReceiver) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        tracing::debug!("Shutdown sender dropped");
    }
}
