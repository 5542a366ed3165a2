//! Signal handling for graceful daemon shutdown.
//!
//! SIGINT and SIGTERM flip the process-wide shutdown watch channel;
//! workers observe it and wind down in the order the daemon awaits them.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Spawn the signal listener. The returned task resolves after the first
/// shutdown signal has been forwarded.
pub fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, relying on Ctrl+C");
            None
        }
    };

    match sigterm.as_mut() {
        Some(sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Ctrl+C received");
}
