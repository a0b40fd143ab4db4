//! Process-wide shutdown signal
//!
//! Wraps a `watch` channel: every long-running task holds a receiver and
//! exits when the value flips to `true`. A fatal condition (backend rejecting
//! our credentials) triggers the same signal and records why, so `main` can
//! exit non-zero.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx), fatal: Arc::new(Mutex::new(None)) }
    }

    /// Receiver for task loops (`shutdown.changed()` in a select)
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        if !self.is_triggered() {
            info!("shutdown_requested");
        }
        self.tx.send_replace(true);
    }

    /// Stop the process because of an unrecoverable condition
    ///
    /// Only the first reason is kept.
    pub fn trigger_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                error!(reason = %reason, "fatal_shutdown");
                *fatal = Some(reason);
            }
        }
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // Err means every sender is gone, which cannot happen while self lives
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());

        shutdown.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.fatal_reason().is_none());
    }

    #[tokio::test]
    async fn test_fatal_keeps_first_reason() {
        let shutdown = Shutdown::new();
        shutdown.trigger_fatal("unauthorized");
        shutdown.trigger_fatal("second");
        assert_eq!(shutdown.fatal_reason().as_deref(), Some("unauthorized"));

        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("wait should resolve after trigger");
    }
}
