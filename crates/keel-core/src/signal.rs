//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Cancellation signal shared by backoff and retry waits."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Level-triggered shutdown flag. Once triggered every pending and future wait returns early
/// until [`ShutdownSignal::reset`] is called.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so `wait_for` only returns once the flag flips
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Sleep for `duration`. Returns `false` when the wait was cut short by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}
