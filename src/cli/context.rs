//! Command execution context
//!
//! Loads the configuration once, opens the embedded store and wires the
//! library components the way a long-running service would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use keystone_resilience::cache::{HierarchicalCache, HttpRemoteCache, RemoteCache};
use keystone_resilience::circuit::CircuitBreaker;
use keystone_resilience::client::RateLimitedClient;
use keystone_resilience::config::Config;
use keystone_resilience::health::HealthDetector;
use keystone_resilience::offline::{AdvisorySource, OfflineModeManager};
use keystone_resilience::storage::Database;

use crate::cli::OutputFormat;

/// Health-check id of the service the advisory client talks to; its breaker
/// state shows up in the status table.
const LIVE_SERVICE: &str = "github";

const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandContext {
    pub config: Config,
    pub db: Arc<Database>,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Load config from `config_path` (or the default location) and open the
    /// embedded database it points at.
    pub fn new(format: OutputFormat, config_path: Option<&str>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(Path::new(path))
                .with_context(|| format!("Failed to load config from {}", path))?,
            None => Config::load()?,
        };

        let db = Database::open(&config.storage).context("Failed to open embedded store")?;

        Ok(Self {
            config,
            db: Arc::new(db),
            format,
        })
    }

    /// Cache over the embedded store, plus the remote tier when configured.
    pub fn cache(&self) -> Result<Arc<HierarchicalCache>> {
        let remote = match &self.config.cache.remote_url {
            Some(url) => {
                let remote = HttpRemoteCache::new(url.as_str(), REMOTE_TIMEOUT)?;
                Some(Arc::new(remote) as Arc<dyn RemoteCache>)
            }
            None => None,
        };

        Ok(Arc::new(HierarchicalCache::new(
            self.config.cache.clone(),
            self.db.clone(),
            remote,
        )))
    }

    pub fn detector(&self) -> Result<Arc<HealthDetector>> {
        Ok(Arc::new(HealthDetector::new(
            self.config.health.clone(),
            self.db.clone(),
        )?))
    }

    /// Offline-mode manager. With `probe`, the detector polls once first so
    /// the reported mode reflects the services right now.
    pub async fn manager(&self, probe: bool) -> Result<OfflineModeManager> {
        let breaker = Arc::new(CircuitBreaker::new(LIVE_SERVICE, self.config.breaker.clone()));
        let client = RateLimitedClient::new(self.config.client.clone(), breaker.clone())?;

        let detector = self.detector()?;
        detector.register_breaker(LIVE_SERVICE, breaker);
        if probe {
            detector.poll_once().await;
        }

        Ok(OfflineModeManager::new(
            detector,
            self.cache()?,
            self.db.clone(),
            Arc::new(AdvisorySource::new(Arc::new(client))),
        ))
    }
}
