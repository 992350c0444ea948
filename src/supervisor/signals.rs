// src/supervisor/signals.rs

//! OS signal propagation.
//!
//! A termination signal (SIGTERM) or interactive interrupt (SIGINT)
//! directed at the supervising process is forwarded to every live
//! instance as an interrupt order. The watcher runs on its own task and
//! only sends over control channels, so it never unwinds in-flight
//! supervision frames, and it keeps listening after each delivery so a
//! failure to handle one signal cannot wedge the next.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::registry::{ControlOrder, LiveRegistry};

/// Spawn the signal watcher for this process.
pub fn spawn_signal_watcher(registry: Arc<LiveRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_termination_signal().await {
                warn!(error = %e, "signal watcher unavailable");
                return;
            }
            let live = registry.all();
            info!(
                instances = live.len(),
                "termination signal received; interrupting live instances"
            );
            for entry in live {
                // try_send keeps the signal path non-blocking; a full or
                // closed channel means the instance is already on its way
                // out.
                let _ = entry.ctrl.try_send(ControlOrder::Interrupt);
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_termination_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
