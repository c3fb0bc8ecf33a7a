//! Process-wide shutdown broadcast.
//!
//! One `ShutdownHandle` lives in the supervisor; every worker holds a cloned
//! `Shutdown` observer. Workers check the signal at each iteration boundary
//! and between rows of a batch, so a trigger is observed promptly without
//! interrupting a row mid-commit.

use tokio::sync::watch;

/// Sender half, held by the supervisor.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiver half, cloned into every worker.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/observer pair.
pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    /// Signal every observer. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// Non-blocking check, used between rows of a batch.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered. Used inside `tokio::select!`
    /// against a tick sleep or a wait-mined future.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Handle dropped without a trigger; treat as shutdown.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_observed() {
        let (handle, shutdown) = channel();
        assert!(!shutdown.is_triggered());

        handle.trigger();
        assert!(shutdown.is_triggered());

        let mut observer = shutdown.clone();
        observer.triggered().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_shutdown() {
        let (handle, shutdown) = channel();
        drop(handle);

        let mut observer = shutdown;
        observer.triggered().await;
    }
}
