//! Cooperative shutdown for a running worker.
//!
//! A [`WorkerHandle`] owns the cancellation token the worker loop checks
//! between cycles. Requesting shutdown never interrupts a running command.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Handle for stopping a worker loop.
#[derive(Debug, Clone, Default)]
pub struct WorkerHandle {
    token: CancellationToken,
}

impl WorkerHandle {
    /// Create a handle with a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// The token to pass to [`Worker::run`](super::Worker::run).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Ask the worker to stop after the current cycle.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown on SIGTERM or SIGINT.
    ///
    /// The listener task ends once the token is cancelled.
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let token = self.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = terminate.recv() => {
                    tracing::info!("worker SIGTERM");
                }
                _ = interrupt.recv() => {
                    tracing::info!("worker SIGINT");
                }
                _ = token.cancelled() => return,
            }
            token.cancel();
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_shared_with_token() {
        let handle = WorkerHandle::new();
        let token = handle.token();

        assert!(!handle.is_shutdown_requested());
        handle.shutdown();
        assert!(handle.is_shutdown_requested());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = WorkerHandle::new();
        let clone = handle.clone();

        clone.shutdown();
        assert!(handle.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_signal_handlers_install() {
        let handle = WorkerHandle::new();
        handle.install_signal_handlers().unwrap();

        // Cancelling ends the listener without a signal
        handle.shutdown();
        assert!(handle.is_shutdown_requested());
    }
}
