//! # Cancellation
//!
//! A one-shot, cloneable cancellation signal built on `tokio::sync::watch`.
//! Backoff waits race against it so that a shutdown never has to wait out a
//! retry delay.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Returned when a wait was interrupted by cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// The triggering side of a cancellation signal
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

/// The observing side of a cancellation signal
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Creates a connected source/observer pair
pub fn cancellation() -> (CancellationSource, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancellationSource { tx }, Cancellation { rx })
}

impl CancellationSource {
    /// Signals every observer. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns a new observer of this source
    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns true once `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Cancellation {
    /// An observer that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true if cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation is signalled.
    ///
    /// If the source is dropped without cancelling, this never completes.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleeps for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(Cancelled),
        }
    }
}
