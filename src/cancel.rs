//! Cancellation plumbing
//!
//! The runtime hands every handler a token observed at each suspension
//! point (downloads, transcoder waits, provider calls). A cancelled handler
//! surfaces `Cancelled`, which the queue treats as a retryable failure.

use tokio::sync::watch;

/// Cancellation side held by the worker runtime.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Cloneable token observed by handlers and ports.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    /// Signals all tokens. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that never fires, for tests and one-shot commands.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the token stays quiet.
        std::mem::forget(tx);
        CancelToken { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled. A dropped runtime counts as
    /// cancelled so orphaned handlers wind down.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Short-circuit check used at the top of loops and between steps.
    pub fn bail_if_cancelled(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (source, token) = CancelSource::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        source.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
        assert!(token.bail_if_cancelled().is_err());
    }

    #[tokio::test]
    async fn test_never_token_stays_quiet() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        assert!(token.bail_if_cancelled().is_ok());
    }
}
