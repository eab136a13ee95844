//! Circuit breaker state machine

use std::future::Future;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{BreakerConfig, BreakerStats, CircuitState};
use crate::error::{BreakerError, Error, Result};

/// Failure-isolating wrapper for calls to one upstream destination.
///
/// Every protected call runs on its own tokio task and races a per-call
/// timeout and the caller's cancellation token. A call that loses the race is
/// aborted and its result discarded.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: RwLock<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    active_probes: u32,
    /// Bumped on every entry into HalfOpen so stale probe slots are ignored
    half_open_epoch: u64,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_failure_at: None,
            active_probes: 0,
            half_open_epoch: 0,
            total_calls: 0,
            rejected_calls: 0,
        }
    }
}

/// Admission ticket for one call. Releases its half-open slot when dropped.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe_epoch: Option<u64>,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.probe_epoch {
            let mut inner = self.breaker.write();
            if inner.state == CircuitState::HalfOpen && inner.half_open_epoch == epoch {
                inner.active_probes = inner.active_probes.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker for the named destination.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerInner::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        self.read().state
    }

    /// Whether a call made now would be rejected as Open.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.read();
        inner.state == CircuitState::Open
            && inner
                .last_failure
                .is_some_and(|t| t.elapsed() < self.config.recovery_timeout)
    }

    /// Run `f` under breaker protection.
    ///
    /// Returns [`BreakerError::Open`] or [`BreakerError::TooManyCalls`] without
    /// invoking `f` when the breaker rejects the call, and
    /// [`BreakerError::Timeout`] when `f` outlives the configured per-call
    /// timeout. Cancellation returns [`Error::Cancelled`] and is not counted
    /// as an upstream failure.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let permit = self.admit()?;
        let mut handle = tokio::spawn(f());

        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) => Err(Error::Other(format!("protected call to {} failed: {}", self.name, e))),
            },
            _ = tokio::time::sleep(self.config.request_timeout) => {
                handle.abort();
                debug!("Call to {} timed out after {:?}", self.name, self.config.request_timeout);
                Err(BreakerError::Timeout(self.config.request_timeout).into())
            }
            _ = cancel.cancelled() => {
                handle.abort();
                return Err(Error::Cancelled);
            }
        };

        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        drop(permit);

        outcome
    }

    /// Force the breaker closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.write();
        let previous = inner.state;
        let total_calls = inner.total_calls;
        let rejected_calls = inner.rejected_calls;
        let epoch = inner.half_open_epoch;

        *inner = BreakerInner::closed();
        inner.total_calls = total_calls;
        inner.rejected_calls = rejected_calls;
        inner.half_open_epoch = epoch + 1;

        if previous != CircuitState::Closed {
            info!("Circuit breaker {} reset from {} to closed", self.name, previous);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.read();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            active_half_open_calls: inner.active_probes,
            last_failure_at: inner.last_failure_at,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn admit(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.write();
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self,
                probe_epoch: None,
            }),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if !recovered {
                    inner.rejected_calls += 1;
                    return Err(BreakerError::Open.into());
                }

                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_epoch += 1;
                inner.active_probes = 1;
                info!("Circuit breaker {} half-open, probing recovery", self.name);

                Ok(CallPermit {
                    breaker: self,
                    probe_epoch: Some(inner.half_open_epoch),
                })
            }
            CircuitState::HalfOpen => {
                if inner.active_probes >= self.config.max_concurrent_calls {
                    inner.rejected_calls += 1;
                    return Err(BreakerError::TooManyCalls.into());
                }
                inner.active_probes += 1;
                Ok(CallPermit {
                    breaker: self,
                    probe_epoch: Some(inner.half_open_epoch),
                })
            }
        }
    }

    /// Results are applied to the state current at completion, not the state
    /// the call was admitted under: a success that lands in HalfOpen counts
    /// toward closing even if the call started while Closed.
    fn on_success(&self) {
        let mut inner = self.write();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.active_probes = 0;
                    info!("Circuit breaker {} closed after successful probes", self.name);
                }
            }
            // A call admitted before the circuit opened; it proves nothing
            CircuitState::Open => {}
        }
    }

    /// Every failure restarts the recovery window, including late failures
    /// from calls admitted before the circuit opened.
    fn on_failure(&self) {
        let mut inner = self.write();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        "Circuit breaker {} opened after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                inner.active_probes = 0;
                warn!("Circuit breaker {} re-opened: probe failed", self.name);
            }
            CircuitState::Open => {}
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BreakerInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BreakerInner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}
