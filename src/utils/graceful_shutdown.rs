use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the gateway is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Requested by the embedding application
    Requested,
}

/// Coordinates the stop of the server, the deployment watcher and the health checker.
///
/// Every background task holds a child of the shared [`CancellationToken`]; the server
/// stops accepting on the first signal and in-flight requests get `drain_timeout` to end.
#[derive(Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Token cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "Shutdown initiated");
            self.token.cancel();
        }
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Wait for SIGINT or SIGTERM, or for a programmatic trigger.
    pub async fn run_signal_handler(&self) -> Result<()> {
        let terminate = wait_for_sigterm();
        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT");
                self.trigger(ShutdownReason::Signal);
            }
            result = terminate => {
                result?;
                tracing::info!("Received SIGTERM");
                self.trigger(ShutdownReason::Signal);
            }
            _ = self.token.cancelled() => {}
        }
        Ok(())
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_child_tokens() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(1));
        let token = shutdown.token();
        assert!(!shutdown.is_shutdown_initiated());

        shutdown.trigger(ShutdownReason::Requested);

        assert!(token.is_cancelled());
        assert!(shutdown.is_shutdown_initiated());
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_handler_returns_on_trigger() {
        let shutdown = GracefulShutdown::new();
        let handler = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.run_signal_handler().await })
        };
        shutdown.trigger(ShutdownReason::Requested);
        let result = tokio::time::timeout(Duration::from_secs(1), handler).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
