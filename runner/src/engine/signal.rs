//! Stop signals and process interrupt handling
//!
//! A `StopSignal` is a level-triggered flag shared between tasks. Once
//! triggered it stays triggered, so a task that subscribes late still
//! observes it.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Cloneable cancellation flag backed by a watch channel
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger the signal. Returns true if this call was the first trigger.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is triggered
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once triggered
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once the process receives Ctrl+C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Install the process-wide interrupt listener.
///
/// Must be called once per process from within a tokio runtime. The returned
/// signal is triggered by the first interrupt and shared by every scenario.
pub fn install_interrupt_handler() -> StopSignal {
    let interrupted = StopSignal::new();
    let trigger = interrupted.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Interrupt received, stopping running scenario");
        trigger.trigger();
    });
    interrupted
}
