//! Cancellation tokens shared between the tasks of one connection or process

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, idempotent cancellation signal
///
/// Clones observe the same signal. Child tokens are cancelled with their
/// parent but can also be cancelled on their own without affecting it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the token; firing an already cancelled token does nothing
    pub fn cancel(&self) {
        self.tx.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token has been cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives as long as `self`, so this only fails on teardown.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Creates a token that is cancelled whenever `self` is
    ///
    /// Must be called from inside a tokio runtime. The forwarding task exits as
    /// soon as either token fires.
    pub fn child_token(&self) -> CancelToken {
        let child = CancelToken::new();

        if self.is_cancelled() {
            child.cancel();
            return child;
        }

        let parent = self.clone();
        let forward = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => forward.cancel(),
                _ = forward.cancelled() => {}
            }
        });

        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
