//! Bounded in-memory tier
//!
//! Reads take the shared lock only; access bookkeeping lives in per-entry
//! atomics. Expired entries read as misses and stay resident until the
//! sweep or an eviction removes them.
//!
//! Eviction ties (equal access order, hit count or expiry) go to the entry
//! inserted first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;

use super::{CacheConfig, CacheEntry, CacheTier, EvictionPolicy};
use crate::clock::expiry_after;

struct MemoryEntry {
    value: Value,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
    /// Logical insertion order, used to break eviction ties
    inserted: u64,
    /// Logical time of the last insert or hit
    last_tick: AtomicU64,
    last_access_ms: AtomicI64,
    hit_count: AtomicU64,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn touch(&self, tick: u64, now: DateTime<Utc>) {
        self.last_tick.store(tick, Ordering::Relaxed);
        self.last_access_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    fn eviction_rank(&self, policy: EvictionPolicy) -> (i64, u64) {
        let primary = match policy {
            EvictionPolicy::Lru => self.last_tick.load(Ordering::Relaxed) as i64,
            EvictionPolicy::Lfu => self.hit_count.load(Ordering::Relaxed) as i64,
            EvictionPolicy::Ttl => self.expires_at.timestamp_millis(),
        };
        (primary, self.inserted)
    }
}

#[derive(Default)]
struct Resident {
    map: HashMap<String, MemoryEntry>,
    bytes: usize,
}

impl Resident {
    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.map.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }
}

/// Fastest, most volatile cache tier
pub struct MemoryTier {
    resident: RwLock<Resident>,
    max_items: usize,
    max_bytes: usize,
    policy: EvictionPolicy,
    tick: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(max_items: usize, max_bytes: usize, policy: EvictionPolicy) -> Self {
        Self {
            resident: RwLock::new(Resident::default()),
            max_items: max_items.max(1),
            max_bytes,
            policy,
            tick: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.memory_max_items,
            config.max_memory_bytes(),
            config.eviction_policy,
        )
    }

    /// Live value for `key`, recording the hit.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        let resident = self.read();
        let entry = resident.map.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.touch(self.next_tick(), now);
        Some(entry.value.clone())
    }

    /// Insert or replace `key`, evicting by policy while the tier is full.
    ///
    /// A value larger than the whole byte budget is not kept here; any older
    /// copy of `key` is dropped and the lower tiers serve it. Returns the
    /// evicted keys.
    pub fn insert(
        &self,
        key: &str,
        value: Value,
        size_bytes: usize,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut resident = self.write();
        resident.remove(key);

        let mut evicted = Vec::new();
        if size_bytes > self.max_bytes {
            debug!(
                "Skipping memory tier for {}: {} bytes exceeds budget of {}",
                key, size_bytes, self.max_bytes
            );
            return evicted;
        }

        while !resident.map.is_empty()
            && (resident.map.len() >= self.max_items
                || resident.bytes.saturating_add(size_bytes) > self.max_bytes)
        {
            let Some(victim) = self.select_victim(&resident.map) else {
                break;
            };
            resident.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted {} from memory tier ({})", victim, self.policy);
            evicted.push(victim);
        }

        let tick = self.next_tick();
        resident.bytes += size_bytes;
        resident.map.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: expiry_after(now, ttl),
                size_bytes,
                inserted: tick,
                last_tick: AtomicU64::new(tick),
                last_access_ms: AtomicI64::new(now.timestamp_millis()),
                hit_count: AtomicU64::new(0),
            },
        );

        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut resident = self.write();
        let expired: Vec<String> = resident
            .map
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            resident.remove(key);
        }
        expired.len()
    }

    pub fn clear(&self) -> usize {
        let mut resident = self.write();
        let count = resident.map.len();
        *resident = Resident::default();
        count
    }

    /// Snapshot of an entry without counting it as a hit.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let resident = self.read();
        let entry = resident.map.get(key)?;
        Some(CacheEntry {
            key: key.to_string(),
            value: entry.value.clone(),
            expires_at: entry.expires_at,
            tier: CacheTier::Memory,
            size_bytes: entry.size_bytes,
            last_access: DateTime::from_timestamp_millis(
                entry.last_access_ms.load(Ordering::Relaxed),
            )
            .unwrap_or_default(),
            hit_count: entry.hit_count.load(Ordering::Relaxed),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.read().bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn select_victim(&self, map: &HashMap<String, MemoryEntry>) -> Option<String> {
        map.iter()
            .min_by_key(|(_, e)| e.eviction_rank(self.policy))
            .map(|(k, _)| k.clone())
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read(&self) -> RwLockReadGuard<'_, Resident> {
        self.resident.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Resident> {
        self.resident.write().unwrap_or_else(|p| p.into_inner())
    }
}
