//! Configuration management for the resilience layer
//!
//! One YAML document covers every component. All sections and fields have
//! defaults, so an empty file (or no file at all) yields a working setup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::cache::CacheConfig;
use crate::circuit::BreakerConfig;
use crate::client::ClientConfig;
use crate::error::{ConfigError, Result};
use crate::health::HealthConfig;
use crate::queue::QueueConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// Embedded store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the embedded database. Defaults to the XDG cache dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::Invalid(
            "Could not determine home directory".to_string(),
        ))?;

        Ok(home.join(".keystone").join("config.yaml"))
    }

    /// Load configuration from the default path, falling back to defaults
    /// when no file exists yet.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents).map_err(ConfigError::from)?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SaveError(e.to_string()))?;

        std::fs::write(path, contents)?;

        // The client section may hold an API token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> crate::error::Error {
            ConfigError::Invalid(msg.to_string()).into()
        }

        if self.cache.memory_max_items == 0 {
            return Err(invalid("cache.memory_max_items must be at least 1"));
        }
        if self.cache.max_memory_mb == 0 {
            return Err(invalid("cache.max_memory_mb must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(invalid("breaker.success_threshold must be at least 1"));
        }
        if self.breaker.max_concurrent_calls == 0 {
            return Err(invalid("breaker.max_concurrent_calls must be at least 1"));
        }
        if self.breaker.request_timeout.is_zero() {
            return Err(invalid("breaker.request_timeout_ms must be positive"));
        }
        if self.client.requests_per_second == 0 {
            return Err(invalid("client.requests_per_second must be at least 1"));
        }
        if self.health.failure_threshold == 0 {
            return Err(invalid("health.failure_threshold must be at least 1"));
        }
        if self.queue.workers == 0 {
            return Err(invalid("queue.workers must be at least 1"));
        }
        if self.queue.batch_size == 0 {
            return Err(invalid("queue.batch_size must be at least 1"));
        }
        if self.queue.queue_size < 4 {
            return Err(invalid("queue.queue_size must be at least 4"));
        }

        let mut seen = HashSet::new();
        for service in &self.health.services {
            if !seen.insert(service.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate health service id '{}'",
                    service.id
                ))
                .into());
            }
        }

        Ok(())
    }
}

/// Serde helper storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
