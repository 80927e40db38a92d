//! Cooperative cancellation for long-running provider operations
//!
//! A [`CancellationSource`] owns the signal; any number of [`CancelToken`]s
//! observe it. Tokens are cheap to clone and are handed to every operation
//! that may block on the remote API (most notably cluster readiness polling).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Owner of the cancellation signal
#[derive(Debug, Clone)]
pub struct CancellationSource {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    /// Set once cancellation has been requested
    is_cancelled: Arc<AtomicBool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            is_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a token observing this source
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.cancel_rx.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation of every operation holding a token
    pub fn cancel(&self) {
        if self.is_cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Cancelling in-flight operations");
        // Receivers are held by `self`, so the send cannot fail.
        let _ = self.cancel_tx.send(true);
    }

    /// Cancel when the process receives SIGINT or SIGTERM
    ///
    /// Terraform interrupts plugins with SIGINT when the user aborts a run.
    pub async fn cancel_on_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("Failed to register signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to register ctrl-c handler: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        self.cancel();
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`CancellationSource`]
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested
    ///
    /// Pends forever if the source is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
