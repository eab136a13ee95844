//! Mode-aware data sourcing
//!
//! [`OfflineModeManager`] answers record lookups from the cache first, then
//! from the live upstream or the local store depending on the operating mode
//! reported by the [`HealthDetector`].

pub mod local;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::{HierarchicalCache, vulnerability_key};
use crate::error::{Error, Result};
use crate::health::{HealthDetector, OperatingMode, ServiceStatus};
use crate::storage::Database;

pub use local::{LOCAL_SOURCE, LocalStore, SeedReport};
pub use source::{AdvisorySource, LiveSource};

/// Operator view of what can be served without upstream access
#[derive(Debug, Clone, Serialize)]
pub struct OfflineCapabilities {
    pub mode: OperatingMode,
    pub local_records: usize,
    pub cached_records: usize,
    pub services: Vec<ServiceStatus>,
    /// Whether lookups can be answered without any upstream
    pub vulnerability_correlation: bool,
}

pub struct OfflineModeManager {
    detector: Arc<HealthDetector>,
    cache: Arc<HierarchicalCache>,
    local: LocalStore,
    live: Arc<dyn LiveSource>,
    live_ttl: Duration,
}

impl OfflineModeManager {
    /// TTL for live results written to the cache and the local store
    pub const DEFAULT_LIVE_TTL: Duration = Duration::from_secs(60 * 60);

    pub fn new(
        detector: Arc<HealthDetector>,
        cache: Arc<HierarchicalCache>,
        db: Arc<Database>,
        live: Arc<dyn LiveSource>,
    ) -> Self {
        Self {
            detector,
            cache,
            local: LocalStore::new(db),
            live,
            live_ttl: Self::DEFAULT_LIVE_TTL,
        }
    }

    pub fn with_live_ttl(mut self, ttl: Duration) -> Self {
        self.live_ttl = ttl;
        self
    }

    pub fn with_local_store(mut self, local: LocalStore) -> Self {
        self.local = local;
        self
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn mode(&self) -> OperatingMode {
        self.detector.mode()
    }

    /// Look up one vulnerability record.
    ///
    /// A cache hit wins in every mode. On a miss:
    /// - online: live fetch, falling back to the local store if it fails
    /// - limited: local store first, then a live fetch
    /// - offline: local store only
    ///
    /// Exhausting every permitted source yields [`Error::DataUnavailable`].
    pub async fn get_vulnerability(&self, vuln_id: &str, cancel: &CancellationToken) -> Result<Value> {
        let key = vulnerability_key(vuln_id);
        if let Some(value) = self.cache.get(&key).await {
            return Ok(value);
        }

        let mode = self.detector.mode();
        debug!("Cache miss for {} in {} mode", key, mode);

        match mode {
            OperatingMode::Online => match self.fetch_live(vuln_id, &key, cancel).await {
                Ok(value) => Ok(value),
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(e) => {
                    warn!("Live fetch for {} failed, trying local store: {}", vuln_id, e);
                    self.lookup_local(vuln_id).ok_or_else(|| unavailable(key, mode))
                }
            },
            OperatingMode::Limited => {
                if let Some(value) = self.lookup_local(vuln_id) {
                    return Ok(value);
                }
                match self.fetch_live(vuln_id, &key, cancel).await {
                    Ok(value) => Ok(value),
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) => {
                        warn!("Live fetch for {} failed: {}", vuln_id, e);
                        Err(unavailable(key, mode))
                    }
                }
            }
            OperatingMode::Offline => self
                .lookup_local(vuln_id)
                .ok_or_else(|| unavailable(key, mode)),
        }
    }

    /// Load operator-supplied records into the local store in one transaction.
    pub fn seed_local_store(&self, records: &[Value]) -> Result<SeedReport> {
        Ok(self.local.seed(records)?)
    }

    pub fn capabilities(&self) -> Result<OfflineCapabilities> {
        let local_records = self.local.local_count()?;
        let cached_records = self.local.cached_count()?;

        Ok(OfflineCapabilities {
            mode: self.detector.mode(),
            local_records,
            cached_records,
            services: self.detector.service_status(),
            vulnerability_correlation: local_records > 0,
        })
    }

    async fn fetch_live(&self, vuln_id: &str, key: &str, cancel: &CancellationToken) -> Result<Value> {
        let value = self.live.fetch(vuln_id, cancel).await?;

        if let Err(e) = self.cache.set(key, value.clone(), self.live_ttl).await {
            warn!("Failed to cache live result for {}: {}", vuln_id, e);
        }
        if let Err(e) = self
            .local
            .record(vuln_id, self.live.name(), &value, self.live_ttl)
        {
            warn!("Failed to record live result for {}: {}", vuln_id, e);
        }

        Ok(value)
    }

    fn lookup_local(&self, vuln_id: &str) -> Option<Value> {
        match self.local.lookup(vuln_id) {
            Ok(found) => found,
            Err(e) => {
                warn!("Local store lookup for {} failed: {}", vuln_id, e);
                None
            }
        }
    }
}

fn unavailable(key: String, mode: OperatingMode) -> Error {
    Error::DataUnavailable { key, mode }
}
