//! Upstream service health and the process-wide operating mode

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitState;

pub mod detector;

pub use detector::HealthDetector;

/// How data requests are sourced, derived from critical-service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Every critical service is healthy
    #[default]
    Online,
    /// Some, but not all, critical services are down
    Limited,
    /// Every critical service is down
    Offline,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Limited => write!(f, "limited"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A monitored upstream service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Stable identifier, also the key of the persisted status row
    pub id: String,
    pub name: String,
    /// Probe URL. Any response below 500 counts as available.
    pub url: String,
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Whether this service counts toward the operating mode
    #[serde(default)]
    pub critical: bool,
}

impl ServiceConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
        critical: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            timeout,
            critical,
        }
    }
}

/// Health detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "poll_interval_ms", with = "crate::config::duration_ms")]
    pub poll_interval: Duration,

    /// Consecutive probe failures after which a service counts as down
    pub failure_threshold: u32,

    pub services: Vec<ServiceConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            failure_threshold: 3,
            services: default_services(),
        }
    }
}

impl HealthConfig {
    pub fn with_services(mut self, services: Vec<ServiceConfig>) -> Self {
        self.services = services;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Services monitored out of the box
pub fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new(
            "github",
            "GitHub API",
            "https://api.github.com/rate_limit",
            Duration::from_secs(10),
            true,
        ),
        ServiceConfig::new(
            "nvd",
            "NVD API",
            "https://services.nvd.nist.gov/rest/json/cves/2.0?resultsPerPage=1",
            Duration::from_secs(15),
            true,
        ),
        ServiceConfig::new(
            "sigstore",
            "Sigstore Fulcio",
            "https://fulcio.sigstore.dev/api/v2/configuration",
            Duration::from_secs(10),
            false,
        ),
    ]
}

/// Latest probe result for one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub critical: bool,
    pub is_available: bool,
    /// `None` until the first probe completes
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub breaker_state: Option<CircuitState>,
}

impl ServiceStatus {
    /// Status before any probe has run
    pub fn unchecked(service: &ServiceConfig) -> Self {
        Self {
            id: service.id.clone(),
            name: service.name.clone(),
            critical: service.critical,
            is_available: true,
            last_check: None,
            response_time_ms: 0,
            consecutive_errors: 0,
            last_error: None,
            breaker_state: None,
        }
    }

    pub fn is_down(&self, failure_threshold: u32) -> bool {
        self.consecutive_errors >= failure_threshold
    }
}

/// Mode from the share of critical services at or over the failure threshold.
///
/// No critical services at all means online.
pub fn derive_mode<'a>(
    statuses: impl IntoIterator<Item = &'a ServiceStatus>,
    failure_threshold: u32,
) -> OperatingMode {
    let (total, down) = statuses
        .into_iter()
        .filter(|s| s.critical)
        .fold((0usize, 0usize), |(total, down), s| {
            (total + 1, down + usize::from(s.is_down(failure_threshold)))
        });

    if down == 0 {
        OperatingMode::Online
    } else if down < total {
        OperatingMode::Limited
    } else {
        OperatingMode::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, critical: bool, errors: u32) -> ServiceStatus {
        let service = ServiceConfig::new(id, id, "http://localhost", Duration::from_secs(1), critical);
        ServiceStatus {
            consecutive_errors: errors,
            ..ServiceStatus::unchecked(&service)
        }
    }

    #[test]
    fn test_mode_with_three_critical_services() {
        let failing = |n: usize| -> Vec<ServiceStatus> {
            (0..3)
                .map(|i| status(&format!("s{}", i), true, if i < n { 3 } else { 0 }))
                .collect()
        };

        assert_eq!(derive_mode(&failing(0), 3), OperatingMode::Online);
        assert_eq!(derive_mode(&failing(1), 3), OperatingMode::Limited);
        assert_eq!(derive_mode(&failing(2), 3), OperatingMode::Limited);
        assert_eq!(derive_mode(&failing(3), 3), OperatingMode::Offline);
    }

    #[test]
    fn test_errors_below_threshold_do_not_count() {
        let statuses = vec![status("a", true, 2), status("b", true, 0)];
        assert_eq!(derive_mode(&statuses, 3), OperatingMode::Online);
    }

    #[test]
    fn test_non_critical_services_are_ignored() {
        let statuses = vec![status("a", true, 0), status("b", false, 10)];
        assert_eq!(derive_mode(&statuses, 3), OperatingMode::Online);

        let statuses = vec![status("a", true, 5), status("b", false, 0)];
        assert_eq!(derive_mode(&statuses, 3), OperatingMode::Offline);
    }

    #[test]
    fn test_no_critical_services_is_online() {
        assert_eq!(derive_mode(&[], 3), OperatingMode::Online);
    }

    #[test]
    fn test_default_services() {
        let services = default_services();
        assert_eq!(services.len(), 3);
        assert_eq!(services.iter().filter(|s| s.critical).count(), 2);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(OperatingMode::Limited.to_string(), "limited");
        assert_eq!(
            serde_json::to_string(&OperatingMode::Offline).unwrap(),
            "\"offline\""
        );
    }
}
