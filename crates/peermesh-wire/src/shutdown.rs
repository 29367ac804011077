//! Shutdown signal shared by every background loop.
//!
//! The orchestrator owns the `watch::Sender<bool>`; loops hold receivers and
//! select on [`shutdown_requested`] at each suspension point.

use tokio::sync::watch;

/// Resolves once shutdown has been signalled or the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
