use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
/// Worker loops stop pulling claim messages once it fires.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token_clone = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}

/// Wait for worker tasks to finish their current job, aborting whatever is
/// still running after `grace`. Returns how many workers were aborted.
pub async fn drain_workers(handles: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    let mut aborted = 0;
    for mut handle in handles {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
            aborted += 1;
        }
    }
    if aborted > 0 {
        tracing::warn!(aborted, "Workers did not drain within grace period");
    }
    aborted
}
