//! Cooperative shutdown signalling.
//!
//! A single [`ShutdownTrigger`] fans out to any number of [`ShutdownSignal`]s.
//! Ingestion, workers, the hub and every periodic task hold a signal and
//! check it at their suspension points; nothing is forcibly aborted.

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Sending half: flips the shared flag once.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Initiate shutdown. Returns `false` if it was already initiated.
    pub fn trigger(&self) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                changed = true;
                true
            }
        });
        if changed {
            info!("Shutdown initiated");
        }
        changed
    }

    /// Create another signal bound to this trigger.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Wait for SIGINT or SIGTERM, then trigger.
    pub async fn trigger_on_os_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
            _ = terminate => info!("Received SIGTERM"),
        }

        self.trigger();
    }
}

impl ShutdownSignal {
    /// A signal that never fires. Handy for tests and embedded use.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether shutdown has been initiated.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been initiated.
    ///
    /// Resolves immediately if it already was. If the trigger is dropped
    /// without firing, this never resolves.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_every_signal() {
        let (trigger, signal) = channel();
        let mut a = signal.clone();
        let mut b = trigger.subscribe();

        assert!(!a.is_triggered());
        assert!(trigger.trigger());
        assert!(!trigger.trigger());

        tokio::time::timeout(Duration::from_secs(1), a.triggered())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.triggered())
            .await
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, mut signal) = channel();
        drop(trigger);

        let waited = tokio::time::timeout(Duration::from_millis(20), signal.triggered()).await;
        assert!(waited.is_err());
        assert!(!signal.is_triggered());
    }
}
