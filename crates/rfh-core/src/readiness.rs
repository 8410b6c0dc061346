//! Ready flag for platform services that connect asynchronously.
//!
//! A profile proxy or service binding reports "connected" from a platform
//! callback. Operations that need it wait on a [`ReadySignal`] with a
//! timeout instead of spinning on a shared boolean.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Shareable ready/not-ready flag with async waiting.
#[derive(Clone, Debug)]
pub struct ReadySignal {
    name: Arc<str>,
    tx: Arc<watch::Sender<bool>>,
}

impl ReadySignal {
    pub fn new(name: &str) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            name: Arc::from(name),
            tx: Arc::new(tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark ready and wake every waiter. Called from the "connected" callback.
    pub fn set_ready(&self) {
        if !self.tx.send_replace(true) {
            debug!(signal = %self.name, "ready");
        }
    }

    /// Mark not ready. Called from the "disconnected" callback.
    pub fn clear(&self) {
        if self.tx.send_replace(false) {
            debug!(signal = %self.name, "no longer ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until ready or until `timeout` elapses. Returns whether ready.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return true;
        }
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .map(|waited| waited.map(|ready| *ready));
        match outcome {
            Ok(Ok(ready)) => ready,
            // Sender is held by `self`, so the channel cannot close here
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(signal = %self.name, ?timeout, "timed out waiting for ready");
                false
            }
        }
    }
}
