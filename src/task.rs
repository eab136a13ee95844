//! Cancellable periodic background tasks
//!
//! Used for the cache sweep and the health polling loop. A tick that has
//! started always runs to completion; cancellation is only observed between
//! ticks, so [`PeriodicTask::stop`] never leaves half-finished work behind.

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Handle to a background task running a closure on a fixed interval.
///
/// The first tick fires immediately after spawning.
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period` on the current tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Background task '{}' started (every {:?})", name, period);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {}
                }
                debug!("Background task '{}' tick", name);
                tick().await;
            }

            info!("Background task '{}' stopped", name);
        });

        Self {
            name,
            token,
            handle,
        }
    }

    /// Signal the task to stop and wait until it has exited.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Background task '{}' ended abnormally: {}", self.name, e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sleep_or_cancel_returns_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = sleep_or_cancel(Duration::from_secs(30), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_tick_is_immediate() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(3600), move || {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_tick() {
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let task = PeriodicTask::spawn("slow", Duration::from_secs(3600), move || {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Let the first tick start, then stop while it is sleeping
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
