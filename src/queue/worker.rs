//! Worker side of the priority queue

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, join_all};
use log::{debug, info};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Priority, QueueConfig};
use crate::error::{Error, Result};
use crate::task::sleep_or_cancel;

pub(super) type Work<T> = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// One unit of work waiting in a priority buffer
pub(super) struct QueuedRequest<T> {
    id: String,
    priority: Priority,
    cancel: CancellationToken,
    work: Work<T>,
    result: oneshot::Sender<Result<T>>,
    enqueued_at: Instant,
}

impl<T> QueuedRequest<T> {
    pub(super) fn new(
        id: String,
        priority: Priority,
        cancel: CancellationToken,
        work: Work<T>,
        result: oneshot::Sender<Result<T>>,
    ) -> Self {
        Self {
            id,
            priority,
            cancel,
            work,
            result,
            enqueued_at: Instant::now(),
        }
    }

    /// Deliver the single result. A caller that dropped its handle is ignored.
    pub(super) fn resolve(self, result: Result<T>) {
        let _ = self.result.send(result);
    }
}

/// State shared by the queue handle and its workers
pub(super) struct Shared<T> {
    pub(super) config: QueueConfig,
    /// Receivers in dispatch order
    receivers: Vec<Mutex<mpsc::Receiver<QueuedRequest<T>>>>,
    /// One permit per buffered request
    pub(super) available: Semaphore,
    pub(super) shutdown: CancellationToken,
}

impl<T> Shared<T> {
    pub(super) fn new(config: QueueConfig, receivers: Vec<mpsc::Receiver<QueuedRequest<T>>>) -> Self {
        Self {
            config,
            receivers: receivers.into_iter().map(Mutex::new).collect(),
            available: Semaphore::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Take the highest-priority buffered request, if any.
    pub(super) fn pop(&self) -> Option<QueuedRequest<T>> {
        self.receivers.iter().find_map(|rx| {
            rx.lock()
                .unwrap_or_else(|p| p.into_inner())
                .try_recv()
                .ok()
        })
    }

    /// Buffered lengths in dispatch order
    pub(super) fn lengths(&self) -> Vec<usize> {
        self.receivers
            .iter()
            .map(|rx| rx.lock().unwrap_or_else(|p| p.into_inner()).len())
            .collect()
    }

    /// Wait for a buffered request. `None` once the queue is closed and empty.
    async fn next(&self) -> Option<QueuedRequest<T>> {
        match self.available.acquire().await {
            Ok(permit) => {
                // Popped in the same poll, so a batch timeout cannot
                // separate the permit from its request
                permit.forget();
                self.pop()
            }
            Err(_) => self.pop(),
        }
    }
}

/// Worker loop: assemble a batch, run it, repeat until drained.
pub(super) async fn run<T: Send + 'static>(shared: Arc<Shared<T>>, worker_id: usize) {
    debug!("Queue worker {} started", worker_id);

    while let Some(first) = shared.next().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + shared.config.batch_interval;

        while batch.len() < shared.config.batch_size {
            match tokio::time::timeout_at(deadline, shared.next()).await {
                Ok(Some(request)) => batch.push(request),
                // Closed and empty, or the batch window elapsed
                Ok(None) | Err(_) => break,
            }
        }

        debug!(
            "Queue worker {} dispatching batch of {}",
            worker_id,
            batch.len()
        );
        join_all(batch.into_iter().map(|r| process(r, &shared.config))).await;
    }

    info!("Queue worker {} exiting", worker_id);
}

async fn process<T>(request: QueuedRequest<T>, config: &QueueConfig) {
    debug!(
        "Processing {} ({}) after {:?} in queue",
        request.id,
        request.priority,
        request.enqueued_at.elapsed()
    );

    let mut attempt: u32 = 0;
    let result = loop {
        if request.cancel.is_cancelled() {
            break Err(Error::Cancelled);
        }

        let outcome = tokio::select! {
            result = (request.work)(request.cancel.clone()) => result,
            _ = request.cancel.cancelled() => Err(Error::Cancelled),
        };

        match outcome {
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                debug!("Retrying {} (attempt {}): {}", request.id, attempt, e);
                if let Err(cancelled) = sleep_or_cancel(config.retry_delay * attempt, &request.cancel).await
                {
                    break Err(cancelled);
                }
            }
            other => break other,
        }
    };

    request.resolve(result);
}
