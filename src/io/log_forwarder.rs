//! Forwards captured log records to the backend `/log` endpoint
//!
//! Posting is best effort: failures are reported on the console only (this
//! module's events are never forwarded) and the record is dropped. Rejected
//! credentials stop the process like any other backend call.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::infra::shutdown::Shutdown;
use crate::infra::LogRecord;
use crate::io::backend::BackendClient;

pub struct LogForwarder {
    backend: Arc<dyn BackendClient>,
    rx: mpsc::Receiver<LogRecord>,
    shutdown: Shutdown,
}

impl LogForwarder {
    pub fn new(backend: Arc<dyn BackendClient>, rx: mpsc::Receiver<LogRecord>, shutdown: Shutdown) -> Self {
        Self { backend, rx, shutdown }
    }

    /// Post records until shutdown or until every sender is gone
    ///
    /// Records already queued when shutdown fires are still posted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("log_forwarder_started");
        let mut forwarded = 0u64;
        let mut failed = 0u64;

        loop {
            let record = tokio::select! {
                record = self.rx.recv() => record,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(record) = record else { break };
            self.forward(record, &mut forwarded, &mut failed).await;
        }

        self.rx.close();
        while let Ok(record) = self.rx.try_recv() {
            self.forward(record, &mut forwarded, &mut failed).await;
        }
        info!(forwarded = %forwarded, failed = %failed, "log_forwarder_stopped");
    }

    async fn forward(&self, record: LogRecord, forwarded: &mut u64, failed: &mut u64) {
        // Credentials already rejected
        if self.shutdown.fatal_reason().is_some() {
            return;
        }
        match self.backend.log(&record.action, record.metadata()).await {
            Ok(()) => *forwarded += 1,
            Err(e) => {
                *failed += 1;
                debug!(action = %record.action, error = %e, "log_post_failed");
                if e.is_fatal() {
                    self.shutdown.trigger_fatal(e.to_string());
                }
            }
        }
    }
}
