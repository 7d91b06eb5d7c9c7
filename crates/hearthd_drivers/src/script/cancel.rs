use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cooperative cancellation handle handed to the script engine.
///
/// Clones share state; cancelling any clone cancels them all. The engine is
/// expected to check it at suspension points (sleeps, blocking host calls).
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancel this token once `timeout` elapses. Dropping the guard disarms
    /// the deadline.
    pub fn deadline(&self, timeout: Duration) -> DeadlineGuard {
        let token = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!("Invocation deadline of {:?} reached, cancelling", timeout);
            token.cancel();
        });
        DeadlineGuard { task }
    }
}

pub struct DeadlineGuard {
    task: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
