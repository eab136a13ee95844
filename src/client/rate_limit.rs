//! Reactive request pacing
//!
//! Pacing stays dormant until an upstream provider first rejects us for rate
//! limiting. From then on every request waits for a local token bucket, so a
//! throttled provider is not hammered again as soon as the retry-after hint
//! expires.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Token-bucket pacer activated by the first rate-limit response.
pub struct RequestPacer {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    active: AtomicBool,
    destination: String,
}

impl RequestPacer {
    /// Create a dormant pacer allowing `per_second` requests once active.
    pub fn new(destination: impl Into<String>, per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: RateLimiter::direct(quota),
            active: AtomicBool::new(false),
            destination: destination.into(),
        }
    }

    /// Turn pacing on. Idempotent.
    pub fn activate(&self) {
        let was_active = self.active.swap(true, Ordering::SeqCst);
        if !was_active {
            info!("Request pacing activated for {}", self.destination);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for a token if pacing is active.
    pub async fn wait_if_active(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        debug!("Waiting for request pacer ({})", self.destination);
        tokio::select! {
            _ = self.limiter.until_ready() => Ok(()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_activation() {
        let pacer = RequestPacer::new("github", 5);
        assert!(!pacer.is_active());

        pacer.activate();
        assert!(pacer.is_active());

        // Second activation should be idempotent
        pacer.activate();
        assert!(pacer.is_active());
    }

    #[tokio::test]
    async fn test_dormant_pacer_does_not_wait() {
        let pacer = RequestPacer::new("github", 1);
        let token = CancellationToken::new();

        for _ in 0..10 {
            pacer.wait_if_active(&token).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_active_pacer_observes_cancellation() {
        let pacer = RequestPacer::new("github", 1);
        pacer.activate();
        let token = CancellationToken::new();

        // Burst capacity is one token; the second wait would take ~1s
        pacer.wait_if_active(&token).await.unwrap();
        token.cancel();
        let result = pacer.wait_if_active(&token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
