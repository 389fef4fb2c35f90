//! Graceful shutdown signaling.
//!
//! A [`ShutdownSignal`] is a broadcast used to stop the reactor and anything
//! else sharing its lifecycle. The reactor owns one and triggers it through
//! its handle; binaries additionally call [`ShutdownSignal::wait`] to tie it
//! to SIGINT/SIGTERM.

use tokio::sync::broadcast;
use tracing::info;

/// Broadcast-based shutdown notification.
///
/// Clones share the same underlying channel: a single [`trigger`] (or OS
/// signal observed by [`wait`]) reaches every subscriber.
///
/// [`trigger`]: ShutdownSignal::trigger
/// [`wait`]: ShutdownSignal::wait
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }

    /// Block until SIGINT or SIGTERM, then notify all subscribers.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                info!(error = %e, "Ctrl+C handler unavailable; waiting forever");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    info!(error = %e, "SIGTERM handler unavailable; waiting forever");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
        }

        self.trigger();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
