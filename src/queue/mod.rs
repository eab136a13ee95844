//! Priority request queue
//!
//! Four bounded buffers, one per [`Priority`], drained by a fixed pool of
//! workers in strict priority order. Workers collect batches and run each
//! batch concurrently, retrying items whose errors are retryable.

mod worker;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, QueueError, Result};
use worker::{QueuedRequest, Shared};

/// Request priority, highest first when dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Dispatch order
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,

    /// Retries after the first attempt, for retryable errors only
    pub max_retries: u32,

    /// Base delay between retries, multiplied by the attempt number
    #[serde(rename = "retry_delay_ms", with = "crate::config::duration_ms")]
    pub retry_delay: Duration,

    pub batch_size: usize,

    /// Longest a worker waits to fill a batch
    #[serde(rename = "batch_interval_ms", with = "crate::config::duration_ms")]
    pub batch_interval: Duration,

    /// Total buffer size, split 1/4 critical, 1/4 high, 1/2 normal, 1/4 low
    pub queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            batch_size: 10,
            batch_interval: Duration::from_secs(1),
            queue_size: 1000,
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, batch_interval: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_interval = batch_interval;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Capacity of the buffer for `priority`, never zero.
    pub fn buffer_size(&self, priority: Priority) -> usize {
        let size = match priority {
            Priority::Normal => self.queue_size / 2,
            _ => self.queue_size / 4,
        };
        size.max(1)
    }
}

/// Caller's side of an enqueued request
pub struct RequestHandle<T> {
    id: String,
    priority: Priority,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> RequestHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Wait for the request's single result.
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Dropped(self.id).into()),
        }
    }
}

/// Queue occupancy
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub workers: usize,
    pub running: bool,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

/// Bounded, prioritized work queue producing `T` per request.
pub struct PriorityQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    senders: tokio::sync::RwLock<Option<Vec<mpsc::Sender<QueuedRequest<T>>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> PriorityQueue<T> {
    /// Create the buffers. Workers start with [`start`](Self::start).
    pub fn new(config: QueueConfig) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = Priority::ALL
            .iter()
            .map(|p| mpsc::channel(config.buffer_size(*p)))
            .unzip();

        Self {
            shared: Arc::new(Shared::new(config, receivers)),
            senders: tokio::sync::RwLock::new(Some(senders)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Spawn the worker pool. No-op if already started or stopped.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() || self.shared.shutdown.is_cancelled() {
            return;
        }

        for id in 0..self.shared.config.workers.max(1) {
            workers.push(tokio::spawn(worker::run(self.shared.clone(), id)));
        }
        info!("Request queue started with {} workers", workers.len());
    }

    /// Queue `work` under `priority`.
    ///
    /// Waits only while the target buffer is full. Cancellation of `cancel`,
    /// queue shutdown and the work's own outcome all resolve the returned
    /// handle. `work` receives `cancel` and may be called again on retry.
    pub async fn enqueue<F, Fut>(
        &self,
        id: impl Into<String>,
        priority: Priority,
        cancel: &CancellationToken,
        work: F,
    ) -> RequestHandle<T>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let handle = RequestHandle {
            id: id.clone(),
            priority,
            rx,
        };
        let request = QueuedRequest::new(
            id,
            priority,
            cancel.clone(),
            Box::new(move |token| work(token).boxed()),
            tx,
        );

        let senders = self.senders.read().await;
        let Some(sender) = senders.as_ref().map(|s| &s[priority.index()]) else {
            request.resolve(Err(QueueError::Shutdown.into()));
            return handle;
        };

        let outcome = match sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(request)) => Err((request, QueueError::Shutdown.into())),
            Err(TrySendError::Full(request)) => {
                debug!("{} buffer full, waiting for space", priority);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err((request, Error::Cancelled)),
                    _ = self.shared.shutdown.cancelled() => {
                        Err((request, QueueError::Shutdown.into()))
                    }
                    permit = sender.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(request);
                            Ok(())
                        }
                        Err(_) => Err((request, QueueError::Shutdown.into())),
                    },
                }
            }
        };

        match outcome {
            Ok(()) => self.shared.available.add_permits(1),
            Err((request, e)) => request.resolve(Err(e)),
        }
        handle
    }

    /// Stop accepting work, let workers drain every buffer and wait for
    /// them to exit.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        // Waits for in-flight enqueues, which observe the shutdown token
        self.senders.write().await.take();
        self.shared.available.close();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Queue worker ended abnormally: {}", e);
            }
        }

        // Never started: nothing will run what is left
        let mut abandoned = 0;
        while let Some(request) = self.shared.pop() {
            request.resolve(Err(QueueError::Shutdown.into()));
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!("Request queue stopped with {} unprocessed requests", abandoned);
        }
        info!("Request queue stopped");
    }

    pub fn stats(&self) -> QueueStats {
        let lengths = self.shared.lengths();
        let running = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|h| !h.is_finished());

        QueueStats {
            workers: self.shared.config.workers,
            running,
            critical: lengths[Priority::Critical.index()],
            high: lengths[Priority::High.index()],
            normal: lengths[Priority::Normal.index()],
            low: lengths[Priority::Low.index()],
            total: lengths.iter().sum(),
        }
    }
}

impl<T: Send + 'static> Drop for PriorityQueue<T> {
    fn drop(&mut self) {
        // Lets idle workers exit if the queue is dropped without stop()
        self.shared.shutdown.cancel();
        self.shared.available.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, BreakerError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> QueueConfig {
        QueueConfig::default()
            .with_workers(1)
            .with_retries(3, Duration::from_millis(5))
            .with_batching(10, Duration::from_millis(20))
    }

    #[test]
    fn test_buffer_split() {
        let config = QueueConfig::default();
        assert_eq!(config.buffer_size(Priority::Critical), 250);
        assert_eq!(config.buffer_size(Priority::High), 250);
        assert_eq!(config.buffer_size(Priority::Normal), 500);
        assert_eq!(config.buffer_size(Priority::Low), 250);
        assert_eq!(
            QueueConfig::default().with_queue_size(2).buffer_size(Priority::Low),
            1
        );
    }

    #[tokio::test]
    async fn test_work_result_is_delivered() {
        let queue = PriorityQueue::new(fast_config());
        queue.start();

        let token = CancellationToken::new();
        let handle = queue
            .enqueue("req-1", Priority::Normal, &token, |_| async { Ok(42u32) })
            .await;
        assert_eq!(handle.id(), "req-1");
        assert_eq!(handle.wait().await.unwrap(), 42);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_critical_starts_before_low() {
        let queue = PriorityQueue::new(fast_config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let record = |name: &'static str| {
            let order = order.clone();
            move |_: CancellationToken| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    Ok::<(), Error>(())
                }
            }
        };

        // Both buffers are filled before any worker runs
        let low = queue
            .enqueue("low", Priority::Low, &token, record("low"))
            .await;
        let critical = queue
            .enqueue("critical", Priority::Critical, &token, record("critical"))
            .await;
        queue.start();

        low.wait().await.unwrap();
        critical.wait().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["critical", "low"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried_up_to_max() {
        let queue = PriorityQueue::<()>::new(fast_config());
        queue.start();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let handle = queue
            .enqueue("flaky", Priority::High, &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::from(BreakerError::Open)) }
            })
            .await;

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::Breaker(BreakerError::Open)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let queue = PriorityQueue::new(fast_config());
        queue.start();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let handle = queue
            .enqueue("eventually", Priority::Normal, &CancellationToken::new(), move |_| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(Error::from(ApiError::RateLimit(Duration::from_millis(1))))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(handle.wait().await.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_attempted_once() {
        let queue = PriorityQueue::<()>::new(fast_config());
        queue.start();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let handle = queue
            .enqueue("bad", Priority::Normal, &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::from(ApiError::NotFound("/x".to_string()))) }
            })
            .await;

        assert!(matches!(
            handle.wait().await,
            Err(Error::Api(ApiError::NotFound(_)))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_while_buffer_is_full() {
        // Four slots per buffer, no workers draining them
        let queue = PriorityQueue::new(fast_config().with_queue_size(4));
        let token = CancellationToken::new();

        let first = queue
            .enqueue("fill", Priority::Low, &token, |_| async { Ok(1) })
            .await;

        let waiter = CancellationToken::new();
        let canceller = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let blocked = queue
            .enqueue("blocked", Priority::Low, &waiter, |_| async { Ok(2) })
            .await;
        assert!(matches!(blocked.wait().await, Err(Error::Cancelled)));
        assert_eq!(queue.stats().low, 1);

        queue.start();
        assert_eq!(first.wait().await.unwrap(), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_resolves_blocked_enqueue() {
        let queue = Arc::new(PriorityQueue::new(fast_config().with_queue_size(4)));
        let token = CancellationToken::new();
        let first = queue
            .enqueue("fill", Priority::Low, &token, |_| async { Ok(1) })
            .await;

        let blocked = tokio::spawn({
            let queue = queue.clone();
            async move {
                let token = CancellationToken::new();
                let handle = queue
                    .enqueue("blocked", Priority::Low, &token, |_| async { Ok(2) })
                    .await;
                handle.wait().await
            }
        });

        // Let the second enqueue reach the full buffer
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(2), queue.stop())
            .await
            .expect("stop waited on a blocked enqueue");

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(Error::Queue(QueueError::Shutdown))));
        assert!(matches!(
            first.wait().await,
            Err(Error::Queue(QueueError::Shutdown))
        ));
    }

    /// Work that tracks how many copies of itself run at once
    fn tracked(
        in_flight: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
    ) -> impl Fn(CancellationToken) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync + 'static
    {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        move |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_batch_runs_concurrently() {
        let queue = PriorityQueue::new(
            fast_config().with_batching(4, Duration::from_secs(1)),
        );
        let token = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            handles.push(
                queue
                    .enqueue(format!("b{}", i), Priority::Normal, &token, tracked(&in_flight, &peak))
                    .await,
            );
        }

        // A full batch is dispatched without waiting out the interval
        let started = std::time::Instant::now();
        queue.start();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(peak.load(Ordering::SeqCst), 4);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_batch_size_caps_concurrency() {
        let queue = PriorityQueue::new(
            fast_config().with_batching(2, Duration::from_millis(10)),
        );
        let token = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            handles.push(
                queue
                    .enqueue(format!("c{}", i), Priority::Normal, &token, tracked(&in_flight, &peak))
                    .await,
            );
        }

        queue.start();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_after_interval() {
        let interval = Duration::from_millis(100);
        let queue = PriorityQueue::new(fast_config().with_batching(10, interval));
        queue.start();

        let started = std::time::Instant::now();
        let handle = queue
            .enqueue("lonely", Priority::High, &CancellationToken::new(), |_| async {
                Ok("flushed")
            })
            .await;

        let result = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("partial batch never flushed");
        assert_eq!(result.unwrap(), "flushed");
        assert!(started.elapsed() >= interval);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_buffers() {
        let queue = PriorityQueue::new(fast_config().with_workers(2));
        let token = CancellationToken::new();
        let mut handles = Vec::new();
        for i in 0..20u32 {
            let priority = Priority::ALL[(i % 4) as usize];
            handles.push(
                queue
                    .enqueue(format!("r{}", i), priority, &token, move |_| async move { Ok(i) })
                    .await,
            );
        }

        queue.start();
        queue.stop().await;
        assert!(!queue.stats().running);

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.wait().await.unwrap());
        }
        results.sort();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let queue = PriorityQueue::new(fast_config());
        queue.start();
        queue.stop().await;

        let handle = queue
            .enqueue("late", Priority::Critical, &CancellationToken::new(), |_| async {
                Ok(())
            })
            .await;
        assert!(matches!(
            handle.wait().await,
            Err(Error::Queue(QueueError::Shutdown))
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_resolves_requests() {
        let queue = PriorityQueue::new(fast_config());
        let handle = queue
            .enqueue("never", Priority::Normal, &CancellationToken::new(), |_| async {
                Ok(())
            })
            .await;

        queue.stop().await;
        assert!(matches!(
            handle.wait().await,
            Err(Error::Queue(QueueError::Shutdown))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = PriorityQueue::new(fast_config());
        let token = CancellationToken::new();
        let _a = queue.enqueue("a", Priority::High, &token, |_| async { Ok(()) }).await;
        let _b = queue.enqueue("b", Priority::Normal, &token, |_| async { Ok(()) }).await;

        let stats = queue.stats();
        assert_eq!(stats.high, 1);
        assert_eq!(stats.normal, 1);
        assert_eq!(stats.total, 2);
        assert!(!stats.running);
        queue.stop().await;
    }
}
