//! Tier orchestration: lookup order, promotion, write-through and sweep

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{CacheConfig, CacheStats, EmbeddedTier, MemoryTier, RemoteCache};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::storage::Database;
use crate::task::PeriodicTask;

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    embedded_hits: AtomicU64,
    embedded_misses: AtomicU64,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    total_gets: AtomicU64,
    total_sets: AtomicU64,
    promotions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn ratio(hits: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Process-wide cache probing memory, embedded and remote tiers in order.
pub struct HierarchicalCache {
    config: CacheConfig,
    memory: MemoryTier,
    embedded: EmbeddedTier,
    remote: Option<Arc<dyn RemoteCache>>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl HierarchicalCache {
    pub fn new(
        config: CacheConfig,
        db: Arc<Database>,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> Self {
        Self {
            memory: MemoryTier::from_config(&config),
            embedded: EmbeddedTier::new(db),
            config,
            remote,
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
            sweeper: Mutex::new(None),
        }
    }

    /// Replace the time source used for expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn embedded(&self) -> &EmbeddedTier {
        &self.embedded
    }

    /// Look `key` up tier by tier, promoting lower-tier hits upward.
    pub async fn get(&self, key: &str) -> Option<Value> {
        bump(&self.counters.total_gets);
        let now = self.clock.now();

        if let Some(value) = self.memory.get(key, now) {
            bump(&self.counters.memory_hits);
            debug!("Cache hit (memory): {}", key);
            return Some(value);
        }
        bump(&self.counters.memory_misses);

        match self.embedded.get(key, now) {
            Ok(Some(value)) => {
                bump(&self.counters.embedded_hits);
                debug!("Cache hit (embedded): {}", key);
                self.promote_to_memory(key, &value);
                return Some(value);
            }
            Ok(None) => bump(&self.counters.embedded_misses),
            Err(e) => {
                warn!("Embedded cache read failed for {}: {}", key, e);
                bump(&self.counters.embedded_misses);
            }
        }

        let Some(remote) = &self.remote else {
            bump(&self.counters.remote_misses);
            return None;
        };

        let data = match remote.get(key).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                bump(&self.counters.remote_misses);
                return None;
            }
            Err(e) => {
                warn!("Remote cache read failed for {}: {}", key, e);
                bump(&self.counters.remote_misses);
                return None;
            }
        };

        let value: Value = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring undecodable remote entry {}: {}", key, e);
                bump(&self.counters.remote_misses);
                return None;
            }
        };

        bump(&self.counters.remote_hits);
        debug!("Cache hit (remote): {}", key);
        self.promote_to_memory(key, &value);
        if let Err(e) = self.embedded.put(
            key,
            &value.to_string(),
            self.config.embedded_ttl,
            self.clock.now(),
        ) {
            warn!("Failed to promote {} into embedded tier: {}", key, e);
        }

        Some(value)
    }

    /// Write `value` to every tier with the same TTL.
    ///
    /// Embedded-tier failures are returned; remote failures are only logged.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        bump(&self.counters.total_sets);
        let now = self.clock.now();
        let json = serde_json::to_string(&value)?;

        self.memory.insert(key, value, json.len(), ttl, now);
        self.embedded.put(key, &json, ttl, now)?;

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.set(key, json.as_bytes(), ttl).await {
                warn!("Remote cache write failed for {}: {}", key, e);
            }
        }

        Ok(())
    }

    /// Remove `key` from every tier.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.memory.remove(key);
        self.embedded.delete(key)?;

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(key).await {
                warn!("Remote cache delete failed for {}: {}", key, e);
            }
        }

        Ok(())
    }

    /// Typed read over [`get`](Self::get). A value of the wrong shape is a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!("Cached value for {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Typed write over [`set`](Self::set).
    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, value, ttl).await
    }

    /// Drop expired entries from the memory and embedded tiers.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = self.memory.purge_expired(now);

        match self.embedded.purge_expired(now) {
            Ok(count) => removed += count,
            Err(e) => warn!("Embedded cache sweep failed: {}", e),
        }

        if removed > 0 {
            debug!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Empty the memory and embedded tiers. The remote tier is shared and left alone.
    pub fn clear(&self) -> Result<usize> {
        self.memory.clear();
        let cleared = self.embedded.clear_all()?;
        Ok(cleared.entries_removed)
    }

    /// Start the background expiry sweep. No-op if already running.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_some() {
            return;
        }

        let cache = Arc::downgrade(self);
        *sweeper = Some(PeriodicTask::spawn(
            "cache-sweep",
            self.config.sweep_interval,
            move || {
                let cache = cache.clone();
                async move {
                    if let Some(cache) = cache.upgrade() {
                        cache.sweep();
                    }
                }
            },
        ));
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn stop(&self) {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let memory_hits = load(&c.memory_hits);
        let embedded_hits = load(&c.embedded_hits);
        let remote_hits = load(&c.remote_hits);
        let total_gets = load(&c.total_gets);

        let embedded_entries = self
            .embedded
            .live_count(self.clock.now())
            .unwrap_or_else(|e| {
                warn!("Failed to count embedded entries: {}", e);
                0
            });

        CacheStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.total_bytes(),
            embedded_entries,
            memory_hits,
            memory_misses: load(&c.memory_misses),
            embedded_hits,
            embedded_misses: load(&c.embedded_misses),
            remote_hits,
            remote_misses: load(&c.remote_misses),
            total_gets,
            total_sets: load(&c.total_sets),
            promotions: load(&c.promotions),
            evictions: self.memory.evictions(),
            hit_ratio: ratio(memory_hits + embedded_hits + remote_hits, total_gets),
            memory_hit_ratio: ratio(memory_hits, total_gets),
            embedded_hit_ratio: ratio(embedded_hits, total_gets),
            remote_hit_ratio: ratio(remote_hits, total_gets),
        }
    }

    fn promote_to_memory(&self, key: &str, value: &Value) {
        let size = value.to_string().len();
        self.memory
            .insert(key, value.clone(), size, self.config.memory_ttl, self.clock.now());
        bump(&self.counters.promotions);
        debug!("Promoted {} into memory tier", key);
    }
}
