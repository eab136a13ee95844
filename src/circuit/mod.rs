//! Per-destination circuit breaking
//!
//! One [`CircuitBreaker`] is shared by every caller that targets the same
//! upstream service. It isolates failures (Open), probes recovery with a
//! bounded number of concurrent calls (HalfOpen) and resumes normal traffic
//! once enough probes succeed (Closed).

pub mod breaker;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use breaker::CircuitBreaker;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Breaker thresholds and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before probing
    #[serde(rename = "recovery_timeout_ms", with = "crate::config::duration_ms")]
    pub recovery_timeout: Duration,

    /// Successful probes needed to close from half-open
    pub success_threshold: u32,

    /// Per-call timeout
    #[serde(rename = "request_timeout_ms", with = "crate::config::duration_ms")]
    pub request_timeout: Duration,

    /// Concurrent calls allowed while half-open
    pub max_concurrent_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(5 * 60),
            success_threshold: 3,
            request_timeout: Duration::from_secs(30),
            max_concurrent_calls: 5,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_calls(mut self, calls: u32) -> Self {
        self.max_concurrent_calls = calls.max(1);
        self
    }
}

/// Point-in-time view of a breaker, for observability
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub active_half_open_calls: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub rejected_calls: u64,
}
