//! Turning termination signals into a single broadcast cancellation.

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Traps SIGINT and SIGTERM once and cancels `token` on the first one.
///
/// Every file session waits on a child of `token`, so one signal stops all
/// of them. The handlers are installed before this returns.
pub fn trap_signals(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        debug!("waiting for signals");
        tokio::select! {
            _ = interrupt.recv() => debug!("SIGINT received"),
            _ = terminate.recv() => debug!("SIGTERM received"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    }))
}
