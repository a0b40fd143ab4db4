//! Bounded worker pool for recognition jobs
//!
//! Jobs are processed off the dispatcher's path: the coordinator submits
//! via a bounded mpsc channel and a fixed set of workers share the
//! receiver. A full queue rejects the job instead of blocking the caller.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Runs one job to completion; failures are handled inside `run`
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    type Job: Send + 'static;

    async fn run(&self, job: Self::Job);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull,
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

struct Queued<J> {
    job: J,
    enqueued_at: Instant,
}

/// Shared between the submitting coordinator and `main`, which shuts it down
pub struct WorkerPool<R: JobRunner> {
    tx: SyncMutex<Option<mpsc::Sender<Queued<R::Job>>>>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl<R: JobRunner> WorkerPool<R> {
    /// Spawn `workers` tasks sharing a queue of `queue_depth` jobs
    pub fn new(runner: Arc<R>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Queued<R::Job>>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, runner.clone(), rx.clone())))
            .collect();

        Self { tx: SyncMutex::new(Some(tx)), workers: SyncMutex::new(workers) }
    }

    /// Enqueue a job without waiting for queue space
    pub fn submit(&self, job: R::Job) -> Result<(), SubmitError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SubmitError::ShuttingDown);
        };
        tx.try_send(Queued { job, enqueued_at: Instant::now() }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
        })
    }

    /// Jobs waiting for a free worker
    pub fn queued(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Stop accepting jobs, then let workers drain the queue within `grace`
    ///
    /// Workers still busy after the grace period are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        info!(workers = %workers.len(), grace_secs = %grace.as_secs(), "worker_pool_draining");

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;
        for mut handle in workers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted = %aborted, "worker_pool_grace_expired");
        } else {
            info!("worker_pool_stopped");
        }
    }
}

async fn worker_loop<R: JobRunner>(
    worker_id: usize,
    runner: Arc<R>,
    rx: Arc<Mutex<mpsc::Receiver<Queued<R::Job>>>>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(queued) = next else { break };

        let queue_delay_ms = queued.enqueued_at.elapsed().as_millis() as u64;
        if queue_delay_ms > 1000 {
            warn!(worker_id = %worker_id, queue_delay_ms = %queue_delay_ms, "job_queue_delay_high");
        }
        runner.run(queued.job).await;
    }
}
