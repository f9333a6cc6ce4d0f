// =============================================================================
// Shutdown signalling — cooperative cancellation for in-flight fetches
// =============================================================================
//
// A watch channel broadcast: the driver flips it on Ctrl-C and every fetch
// task races its waits (network call, pacing sleep, retry backoff) against
// it. Results already committed for completed timeframes are retained.
// =============================================================================

use tokio::sync::watch;

/// Sending half, held by the driver.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal every listener to stop at the next await point.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half, cloned into each fetch task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires. For callers (and tests) that do not need
    /// cancellation.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether shutdown has already been requested.
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once shutdown is requested. A dropped sender counts as
    /// shutdown — the driver is gone, so the fetch should stop too.
    pub async fn cancelled(&mut self) {
        match &mut self.rx {
            None => std::future::pending().await,
            Some(rx) => loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            },
        }
    }
}

/// Create a connected handle/signal pair.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx: Some(rx) })
}
