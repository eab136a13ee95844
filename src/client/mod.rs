//! Rate-aware client for upstream vulnerability-intelligence APIs

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::circuit::BreakerStats;

pub mod rate_limit;
pub mod upstream;

pub use rate_limit::RequestPacer;
pub use upstream::RateLimitedClient;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL requests are resolved against
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Start backing off once this few requests remain in the quota
    pub rate_limit_threshold: u64,

    /// Base delay for the proactive exponential backoff
    #[serde(rename = "backoff_base_ms", with = "crate::config::duration_ms")]
    pub backoff_base: Duration,

    /// Upper bound for the proactive backoff
    #[serde(rename = "max_backoff_ms", with = "crate::config::duration_ms")]
    pub max_backoff: Duration,

    /// Local pacing rate once the provider has throttled us
    pub requests_per_second: u32,

    /// Path of the quota-status endpoint
    pub quota_path: String,

    /// Transport-level timeout, independent of the breaker's call timeout
    #[serde(rename = "http_timeout_ms", with = "crate::config::duration_ms")]
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            // 20% of a 5000/hour budget
            rate_limit_threshold: 1000,
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            requests_per_second: 10,
            quota_path: "/rate_limit".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_rate_limit_threshold(mut self, threshold: u64) -> Self {
        self.rate_limit_threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    /// Proactive delay for the given quota, if any is needed.
    ///
    /// Grows as `base * 2^(deficit / 100)` where the deficit is how far the
    /// remaining quota has fallen below the threshold, capped at `max_backoff`.
    pub fn backoff_for(&self, quota: &QuotaSnapshot) -> Option<Duration> {
        if quota.remaining > self.rate_limit_threshold {
            return None;
        }

        let deficit = (self.rate_limit_threshold - quota.remaining) as f64;
        let secs = self.backoff_base.as_secs_f64() * 2f64.powf(deficit / 100.0);

        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            Some(self.max_backoff)
        } else {
            Some(Duration::from_secs_f64(secs))
        }
    }
}

/// Most recently observed provider quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub used: u64,
}

impl QuotaSnapshot {
    /// Parse `x-ratelimit-*` headers. Limit, remaining and reset are required.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        }

        let limit = header_u64(headers, "x-ratelimit-limit")?;
        let remaining = header_u64(headers, "x-ratelimit-remaining")?;
        let reset = header_u64(headers, "x-ratelimit-reset")?;
        let used = header_u64(headers, "x-ratelimit-used").unwrap_or(limit.saturating_sub(remaining));

        Some(Self {
            limit,
            remaining,
            reset_at: DateTime::from_timestamp(reset as i64, 0)?,
            used,
        })
    }
}

/// Body of the quota-status endpoint: `{resources:{core:{...}}}`
#[derive(Debug, Deserialize)]
pub(crate) struct QuotaStatusResponse {
    pub resources: QuotaResources,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QuotaResources {
    pub core: RawQuota,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawQuota {
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
    #[serde(default)]
    pub used: u64,
}

impl RawQuota {
    pub(crate) fn into_snapshot(self) -> Option<QuotaSnapshot> {
        Some(QuotaSnapshot {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: DateTime::from_timestamp(self.reset, 0)?,
            used: self.used,
        })
    }
}

/// Client statistics including breaker state
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub breaker: BreakerStats,
    pub quota: Option<QuotaSnapshot>,
    pub pacing_active: bool,
}
