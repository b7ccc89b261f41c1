//! Serialization queue
//!
//! All envelope handling for one receiver funnels through a single
//! worker so session-state mutations for consecutive envelopes never
//! race. Job n+1 does not start until job n has fully completed,
//! including its event emission.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The queue worker has shut down
#[derive(Debug, Error, PartialEq, Eq)]
#[error("serialization queue closed")]
pub struct QueueClosed;

/// Single-worker FIFO executor
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Spawn the worker task. The worker exits when the queue is
    /// dropped and all enqueued jobs have run.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("serialization queue drained");
        });
        Self { tx }
    }

    /// Run `fut` after all previously enqueued work, returning its
    /// output.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, QueueClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        self.tx.send(job).map_err(|_| QueueClosed)?;
        done_rx.await.map_err(|_| QueueClosed)
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}
