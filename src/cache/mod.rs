//! Three-tier response cache
//!
//! Values are JSON documents held in a bounded in-memory tier, the embedded
//! SQLite store and an optional remote key/value service, probed in that
//! order. Hits in a lower tier are promoted into every faster tier.

pub mod embedded;
pub mod hierarchical;
pub mod key;
pub mod memory;
pub mod remote;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use embedded::{ClearStats, EmbeddedStats, EmbeddedTier};
pub use hierarchical::HierarchicalCache;
pub use key::{cache_key, vulnerability_key};
pub use memory::MemoryTier;
pub use remote::{HttpRemoteCache, RemoteCache};

/// Which entry the memory tier gives up when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicy {
    /// Least recently accessed
    #[default]
    Lru,
    /// Lowest hit count
    Lfu,
    /// Soonest expiry
    Ttl,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "LRU"),
            Self::Lfu => write!(f, "LFU"),
            Self::Ttl => write!(f, "TTL"),
        }
    }
}

/// Storage layer an entry was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Memory,
    Embedded,
    Remote,
}

/// Point-in-time view of one cached entry
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub tier: CacheTier,
    pub size_bytes: usize,
    pub last_access: DateTime<Utc>,
    pub hit_count: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Item cap of the memory tier
    pub memory_max_items: usize,

    /// TTL applied when a value is promoted into the memory tier
    #[serde(rename = "memory_ttl_ms", with = "crate::config::duration_ms")]
    pub memory_ttl: Duration,

    /// TTL applied when a remote hit is promoted into the embedded tier
    #[serde(rename = "embedded_ttl_ms", with = "crate::config::duration_ms")]
    pub embedded_ttl: Duration,

    pub eviction_policy: EvictionPolicy,

    /// Byte budget of the memory tier
    pub max_memory_mb: u64,

    /// Interval of the background expiry sweep
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,

    /// Base URL of an [`HttpRemoteCache`]; no remote tier when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_items: 1000,
            memory_ttl: Duration::from_secs(5 * 60),
            embedded_ttl: Duration::from_secs(60 * 60),
            eviction_policy: EvictionPolicy::Lru,
            max_memory_mb: 100,
            sweep_interval: Duration::from_secs(10 * 60),
            remote_url: None,
        }
    }
}

impl CacheConfig {
    pub fn with_memory_max_items(mut self, items: usize) -> Self {
        self.memory_max_items = items.max(1);
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_promotion_ttls(mut self, memory: Duration, embedded: Duration) -> Self {
        self.memory_ttl = memory;
        self.embedded_ttl = embedded;
        self
    }

    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }
}

/// Hit/miss accounting for the whole cache
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub embedded_entries: usize,

    pub memory_hits: u64,
    pub memory_misses: u64,
    pub embedded_hits: u64,
    pub embedded_misses: u64,
    pub remote_hits: u64,
    pub remote_misses: u64,

    pub total_gets: u64,
    pub total_sets: u64,
    pub promotions: u64,
    pub evictions: u64,

    pub hit_ratio: f64,
    pub memory_hit_ratio: f64,
    pub embedded_hit_ratio: f64,
    pub remote_hit_ratio: f64,
}
