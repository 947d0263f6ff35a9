//! Cooperative shutdown for the polling loops.
//!
//! Loops check the signal at tick boundaries and while sleeping; work already in
//! progress for an item finishes first, so the vault is never left mid-move.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Fires the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    _sender: Option<Arc<watch::Sender<bool>>>,
}

/// Create a connected trigger/signal pair
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger {
            tx: Arc::new(tx),
        },
        ShutdownSignal { rx, _sender: None },
    )
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Receivers may all be gone already
        let _ = self.tx.send(true);
    }

    /// Fire on Ctrl+C
    pub fn trigger_on_ctrl_c(self) {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                self.trigger();
            }
        });
    }
}

impl ShutdownSignal {
    /// A signal that never fires (for `--once` runs and tests)
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Holding the sender keeps `changed()` pending instead of erroring
        Self {
            rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless shutdown fires first. Returns `true` on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            changed = self.rx.changed() => {
                // Sender dropped: nobody can trigger any more, treat as shutdown
                changed.is_err() || self.is_triggered()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_interrupted_by_trigger() {
        let (trigger, mut signal) = channel();

        let handle = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        trigger.trigger();

        let stopped = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_sleep_completes_without_trigger() {
        let (_trigger, mut signal) = channel();
        assert!(!signal.sleep(Duration::from_millis(10)).await);
        assert!(!signal.is_triggered());
    }

    #[tokio::test]
    async fn test_never() {
        let mut signal = ShutdownSignal::never();
        assert!(!signal.sleep(Duration::from_millis(10)).await);
    }
}
