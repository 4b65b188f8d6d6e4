// src/shutdown.rs
//! Process shutdown wiring shared by both binaries.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels `cancel` once `signal` resolves `Ok`. A signal that cannot be
/// installed is logged and never fires; the process then runs until killed.
pub async fn cancel_on<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for ctrl-c, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

pub fn spawn_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(cancel_on(tokio::signal::ctrl_c(), cancel))
}
