use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};

/// Listen for SIGTERM/SIGINT and cancel the returned token when one arrives.
///
/// Every long-running loop (leader controller, cycle driver, gRPC server)
/// selects on this token and drains when it fires. A second signal while
/// draining aborts the process.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| SchedulerError::Internal(format!("installing SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| SchedulerError::Internal(format!("installing SIGINT handler: {e}")))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
            _ = sigint.recv() => tracing::info!("received SIGINT, draining"),
        }
        handler_token.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::error!("second shutdown signal, aborting");
        std::process::exit(1);
    });

    Ok(token)
}
