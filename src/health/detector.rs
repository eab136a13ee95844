//! Background probing of upstream services
//!
//! Each poll probes every configured service concurrently, updates the
//! in-memory status map, persists one row per service and recomputes the
//! operating mode. The mode is published through a `watch` channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use rusqlite::params;
use tokio::sync::watch;

use super::{HealthConfig, OperatingMode, ServiceConfig, ServiceStatus, derive_mode};
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::error::{ApiError, CacheError, Result};
use crate::storage::Database;
use crate::task::PeriodicTask;

/// Result of probing a single service
struct ProbeOutcome {
    available: bool,
    response_time_ms: u64,
    error: Option<String>,
}

/// Polls service health and derives the [`OperatingMode`].
pub struct HealthDetector {
    config: HealthConfig,
    http: reqwest::Client,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    statuses: RwLock<HashMap<String, ServiceStatus>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    mode: watch::Sender<OperatingMode>,
    poller: Mutex<Option<PeriodicTask>>,
}

impl HealthDetector {
    pub fn new(config: HealthConfig, db: Arc<Database>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("keystone/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ApiError::from)?;

        let statuses = config
            .services
            .iter()
            .map(|s| (s.id.clone(), ServiceStatus::unchecked(s)))
            .collect();

        let (mode, _) = watch::channel(OperatingMode::Online);

        Ok(Self {
            config,
            http,
            db,
            clock: Arc::new(SystemClock),
            statuses: RwLock::new(statuses),
            breakers: RwLock::new(HashMap::new()),
            mode,
            poller: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record the breaker guarding `service_id` so its state is persisted
    /// alongside the probe results.
    pub fn register_breaker(&self, service_id: impl Into<String>, breaker: Arc<CircuitBreaker>) {
        self.breakers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(service_id.into(), breaker);
    }

    pub fn mode(&self) -> OperatingMode {
        *self.mode.borrow()
    }

    /// Receiver notified on every mode transition.
    pub fn subscribe(&self) -> watch::Receiver<OperatingMode> {
        self.mode.subscribe()
    }

    /// Copy of every in-memory status, in configuration order.
    pub fn service_status(&self) -> Vec<ServiceStatus> {
        let statuses = self.statuses.read().unwrap_or_else(|p| p.into_inner());
        self.config
            .services
            .iter()
            .filter_map(|s| statuses.get(&s.id).cloned())
            .collect()
    }

    /// Probe every service once and return the resulting mode.
    pub async fn poll_once(&self) -> OperatingMode {
        let outcomes = join_all(
            self.config
                .services
                .iter()
                .map(|service| probe(&self.http, service)),
        )
        .await;

        let now = self.clock.now();
        let breaker_states: HashMap<String, CircuitState> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, b)| (id.clone(), b.state()))
            .collect();

        let updated: Vec<ServiceStatus> = {
            let mut statuses = self.statuses.write().unwrap_or_else(|p| p.into_inner());
            self.config
                .services
                .iter()
                .zip(outcomes)
                .map(|(service, outcome)| {
                    let status = statuses
                        .entry(service.id.clone())
                        .or_insert_with(|| ServiceStatus::unchecked(service));
                    apply_outcome(status, outcome, now);
                    status.breaker_state = breaker_states.get(&service.id).copied();
                    status.clone()
                })
                .collect()
        };

        for status in &updated {
            if let Err(e) = self.persist(status) {
                warn!("Failed to persist status for {}: {}", status.id, e);
            }
        }

        let mode = derive_mode(&updated, self.config.failure_threshold);
        let previous = self.mode.send_replace(mode);
        if previous != mode {
            info!("Operating mode changed from {} to {}", previous, mode);
        }
        mode
    }

    /// Start background polling. The first poll runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if poller.is_some() {
            return;
        }

        let detector = Arc::downgrade(self);
        *poller = Some(PeriodicTask::spawn(
            "health-poll",
            self.config.poll_interval,
            move || {
                let detector = detector.clone();
                async move {
                    if let Some(detector) = detector.upgrade() {
                        detector.poll_once().await;
                    }
                }
            },
        ));
    }

    /// Stop polling, waiting for an in-flight poll to finish.
    pub async fn stop(&self) {
        let task = self.poller.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Status rows as last written to the embedded store.
    pub fn persisted_status(&self) -> Result<Vec<ServiceStatus>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT service_name, display_name, is_available, last_check, failure_count,
                        response_time_ms, circuit_breaker_state, last_error
                 FROM external_service_status ORDER BY service_name",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .map(
                |(id, name, available, last_check, failures, response_ms, state, last_error)| {
                    let critical = self
                        .config
                        .services
                        .iter()
                        .any(|s| s.id == id && s.critical);
                    ServiceStatus {
                        id,
                        name,
                        critical,
                        is_available: available,
                        last_check: DateTime::from_timestamp_millis(last_check),
                        response_time_ms: response_ms.max(0) as u64,
                        consecutive_errors: failures.max(0) as u32,
                        last_error,
                        breaker_state: state.as_deref().and_then(parse_state),
                    }
                },
            )
            .collect())
    }

    fn persist(&self, status: &ServiceStatus) -> std::result::Result<(), CacheError> {
        let now_ms = self.clock.now().timestamp_millis();
        let last_check = status.last_check.map_or(now_ms, |t| t.timestamp_millis());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO external_service_status
                 (service_name, display_name, is_available, last_check, failure_count,
                  response_time_ms, circuit_breaker_state, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    status.id,
                    status.name,
                    status.is_available,
                    last_check,
                    status.consecutive_errors,
                    status.response_time_ms as i64,
                    status.breaker_state.map(|s| s.to_string()),
                    status.last_error,
                    now_ms,
                ],
            )
        })?;
        Ok(())
    }
}

async fn probe(http: &reqwest::Client, service: &ServiceConfig) -> ProbeOutcome {
    let started = Instant::now();
    let result = http.get(&service.url).timeout(service.timeout).send().await;
    let response_time_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) if response.status().is_server_error() => {
            debug!("Probe {} returned {}", service.id, response.status());
            ProbeOutcome {
                available: false,
                response_time_ms,
                error: Some(format!("HTTP {}", response.status().as_u16())),
            }
        }
        Ok(_) => ProbeOutcome {
            available: true,
            response_time_ms,
            error: None,
        },
        Err(e) => {
            warn!("Probe {} failed: {}", service.id, e);
            ProbeOutcome {
                available: false,
                response_time_ms,
                error: Some(format!("Request failed: {}", e)),
            }
        }
    }
}

fn apply_outcome(status: &mut ServiceStatus, outcome: ProbeOutcome, now: DateTime<Utc>) {
    status.is_available = outcome.available;
    status.last_check = Some(now);
    status.response_time_ms = outcome.response_time_ms;
    if outcome.available {
        status.consecutive_errors = 0;
        status.last_error = None;
    } else {
        status.consecutive_errors = status.consecutive_errors.saturating_add(1);
        status.last_error = outcome.error;
    }
}

fn parse_state(s: &str) -> Option<CircuitState> {
    match s {
        "closed" => Some(CircuitState::Closed),
        "open" => Some(CircuitState::Open),
        "half_open" => Some(CircuitState::HalfOpen),
        _ => None,
    }
}
