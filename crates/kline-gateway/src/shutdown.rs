use std::sync::Arc;

use kline_gateway_lib::Gateway;
use tracing::{info, warn};

/// Wait for SIGTERM or ctrl-c, then close the gateway.
///
/// Closing the gateway ends every client session, which lets the HTTP server
/// finish its graceful shutdown.
pub async fn wait_for_shutdown(gateway: Arc<Gateway>) {
    shutdown_signal().await;
    info!("shutdown signal received");
    gateway.shutdown().await;
}

/// Listen for SIGTERM (Kubernetes pod termination) or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGTERM, using ctrl-c only");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = ctrl_c() => info!("ctrl-c received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
