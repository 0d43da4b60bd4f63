//! One-shot readiness gate for newly reserved devices
//!
//! A reservation in the topology store is handed out before the kernel
//! device exists. The caller that created the entry performs the kernel work,
//! records the final index, and opens the gate; every other caller that found
//! the entry already present awaits the gate and then re-reads the store.
//! The gate must be opened on every exit path of the creator, including
//! failure, so waiters distinguish success from failure by the index
//! sentinel, not by the gate itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A one-shot latch with a timed wait. Cloning produces another handle to
/// the same gate.
#[derive(Debug, Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadyGate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Opens the gate, releasing all current and future waiters.
    /// Opening an already-open gate is a no-op.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits for the gate to open, up to `limit`. Returns false on timeout.
    pub async fn wait(&self, limit: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let result = tokio::time::timeout(limit, rx.wait_for(|open| *open)).await;
        result.is_ok()
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}
