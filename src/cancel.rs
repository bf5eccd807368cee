//! Cancellation Signals
//!
//! A `CancellationSignal` is the sending side of a one-way "stop now" flag,
//! backed by a `tokio::sync::watch` channel. `CancelToken` is the cheap,
//! cloneable receiving side handed to long-running collaborators.
//!
//! Child signals are cancelled when their parent is, but cancelling a child
//! never affects the parent. The orchestrator uses this to scope the
//! fault-and-load phase under the run-level signal.

use std::future::pending;
use std::sync::Arc;
use tokio::sync::watch;

/// Sending side of a cancellation flag
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel every token derived from this signal
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Create a signal that is cancelled whenever this one is
    ///
    /// The forwarding task ends once the child is cancelled or every clone
    /// of it is dropped. Must be called from within a tokio runtime.
    pub fn child(&self) -> CancellationSignal {
        let child = CancellationSignal::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }

        let parent = self.token();
        let forward = Arc::downgrade(&child.tx);
        let mut child_rx = child.tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                fired = parent.wait() => {
                    if let (true, Some(tx)) = (fired, forward.upgrade()) {
                        tx.send_replace(true);
                    }
                }
                // Child cancelled on its own or dropped; stop forwarding
                _ = async {
                    let _ = child_rx.wait_for(|cancelled| *cancelled).await;
                } => {}
            }
        });
        child
    }
}

/// Receiving side of a cancellation flag
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        CancellationSignal::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled
    ///
    /// Pends forever if the signal is dropped without being cancelled.
    pub async fn cancelled(&self) {
        if !self.wait().await {
            pending::<()>().await;
        }
    }

    /// Wait for cancellation; returns `false` if the signal was dropped first
    async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_token() {
        let signal = CancellationSignal::new();
        let token = signal.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move { token.cancelled().await });
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("token should wake")
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_token_created_after_cancel_is_cancelled() {
        let signal = CancellationSignal::new();
        signal.cancel();
        let token = signal.token();
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled token resolves immediately");
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = CancellationSignal::new();
        let child = parent.child();
        let token = child.token();

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("child should be cancelled with parent");
    }

    #[tokio::test]
    async fn test_child_does_not_cancel_parent() {
        let parent = CancellationSignal::new();
        let child = parent.child();
        child.cancel();
        tokio::task::yield_now().await;
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_child_stops_forwarding() {
        let parent = CancellationSignal::new();
        let child = parent.child();
        assert!(parent.tx.receiver_count() > 0);

        drop(child);
        for _ in 0..50 {
            if parent.tx.receiver_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(parent.tx.receiver_count(), 0);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = CancelToken::never();
        let result = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(result.is_err());
    }
}
