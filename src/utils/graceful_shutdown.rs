use std::sync::{Mutex, PoisonError};

use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the process is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Requested from inside the process
    Manual,
}

/// Fans a single shutdown event out to the listener and background tasks.
///
/// Every long-running task holds a child of [`GracefulShutdown::token`] and stops
/// when it is cancelled.
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start shutdown. Only the first call has an effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
            return;
        }
        *current = Some(reason);
        tracing::info!("Shutdown initiated: {:?}", reason);
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGINT and SIGTERM");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for SIGINT: {}", e);
                    std::future::pending::<()>().await;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.trigger_shutdown(ShutdownReason::Signal);
        Ok(())
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait_for_shutdown_signal(&self) -> Option<ShutdownReason> {
        self.token.cancelled().await;
        self.reason()
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert_eq!(shutdown.reason(), None);
    }

    #[test]
    fn test_manual_trigger_cancels_tokens() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();

        shutdown.trigger_shutdown(ShutdownReason::Manual);
        shutdown.trigger_shutdown(ShutdownReason::Signal);

        assert!(token.is_cancelled());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Manual));
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_signal() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger_shutdown(ShutdownReason::Manual);
        });

        let reason = tokio::time::timeout(Duration::from_secs(2), shutdown.wait_for_shutdown_signal())
            .await
            .expect("shutdown should be observed");
        assert_eq!(reason, Some(ShutdownReason::Manual));
    }

    #[tokio::test]
    async fn test_signal_handler_returns_after_manual_shutdown() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Manual);
        assert!(shutdown.run_signal_handler().await.is_ok());
    }
}
