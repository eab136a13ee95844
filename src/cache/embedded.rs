//! SQLite-backed cache tier
//!
//! Values are stored as JSON text in `cache_entries`. Expiry is compared in
//! Unix milliseconds against the caller's clock, so expired rows read as
//! misses before the sweep gets to them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{CacheEntry, CacheTier};
use crate::clock::expiry_after;
use crate::error::CacheError;
use crate::storage::Database;

type Result<T> = std::result::Result<T, CacheError>;

/// Durable cache tier over the shared embedded database
pub struct EmbeddedTier {
    db: Arc<Database>,
}

impl EmbeddedTier {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Get a live value and record the access.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Value>> {
        let now_ms = now.timestamp_millis();

        let raw: Option<String> = self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_ms],
                    |row| row.get(0),
                )
                .optional()?;

            if raw.is_some() {
                conn.execute(
                    "UPDATE cache_entries SET access_time = ?2, hit_count = hit_count + 1
                     WHERE key = ?1",
                    params![key, now_ms],
                )?;
            }
            Ok(raw)
        })?;

        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| CacheError::Serialization(format!("Corrupt entry {}: {}", key, e)))
        })
        .transpose()
    }

    /// Store pre-serialized JSON with a TTL
    pub fn put(&self, key: &str, json: &str, ttl: Duration, now: DateTime<Utc>) -> Result<()> {
        let now_ms = now.timestamp_millis();
        let expires = expiry_after(now, ttl).timestamp_millis();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (key, value, expires_at, size, access_time, hit_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5)",
                params![key, json, expires, json.len() as i64, now_ms],
            )
        })?;
        Ok(())
    }

    /// Delete a specific entry by key
    pub fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM cache_entries WHERE key = ?1", [key]))?;
        Ok(deleted > 0)
    }

    /// Remove expired rows. Returns how many were deleted.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                [now.timestamp_millis()],
            )
        })
    }

    /// Clear all cache entries
    pub fn clear_all(&self) -> Result<ClearStats> {
        let removed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM cache_entries", []))?;

        Ok(ClearStats {
            entries_removed: removed,
        })
    }

    /// Snapshot of a row without counting it as a hit.
    pub fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row: Option<(String, i64, i64, i64, i64)> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value, expires_at, size, access_time, hit_count
                 FROM cache_entries WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
        })?;

        let Some((raw, expires_at, size, access_time, hit_count)) = row else {
            return Ok(None);
        };

        let value = serde_json::from_str(&raw)
            .map_err(|e| CacheError::Serialization(format!("Corrupt entry {}: {}", key, e)))?;

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            expires_at: DateTime::from_timestamp_millis(expires_at).unwrap_or_default(),
            tier: CacheTier::Embedded,
            size_bytes: size as usize,
            last_access: DateTime::from_timestamp_millis(access_time).unwrap_or_default(),
            hit_count: hit_count as u64,
        }))
    }

    /// Number of rows that have not expired
    pub fn live_count(&self, now: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM cache_entries WHERE expires_at > ?1",
                [now.timestamp_millis()],
                |r| r.get(0),
            )
        })?;
        Ok(count as usize)
    }

    /// Get tier statistics
    pub fn stats(&self, now: DateTime<Utc>) -> Result<EmbeddedStats> {
        let now_ms = now.timestamp_millis();

        self.db.with_conn(|conn| {
            let total_entries: i64 =
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;

            let valid_entries: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cache_entries WHERE expires_at > ?1",
                [now_ms],
                |r| r.get(0),
            )?;

            let total_size: i64 = conn.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM cache_entries",
                [],
                |r| r.get(0),
            )?;

            let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(created_at), MAX(created_at) FROM cache_entries WHERE expires_at > ?1",
                [now_ms],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;

            Ok(EmbeddedStats {
                total_entries: total_entries as usize,
                valid_entries: valid_entries as usize,
                expired_entries: (total_entries - valid_entries) as usize,
                total_size_bytes: total_size as usize,
                oldest_entry: oldest.and_then(DateTime::from_timestamp_millis),
                newest_entry: newest.and_then(DateTime::from_timestamp_millis),
            })
        })
    }
}

/// Statistics about cache clear operation
#[derive(Debug)]
pub struct ClearStats {
    pub entries_removed: usize,
}

/// Statistics about the embedded tier
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddedStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub total_size_bytes: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_tier() -> (EmbeddedTier, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path()).unwrap();
        (EmbeddedTier::new(Arc::new(db)), dir)
    }

    #[test]
    fn test_put_get() {
        let (tier, _dir) = test_tier();
        let now = Utc::now();

        tier.put("key1", r#"{"v":1}"#, Duration::from_secs(60), now)
            .unwrap();

        let result = tier.get("key1", now).unwrap();
        assert_eq!(result, Some(json!({"v": 1})));
    }

    #[test]
    fn test_get_records_access() {
        let (tier, _dir) = test_tier();
        let now = Utc::now();
        tier.put("k", "1", Duration::from_secs(60), now).unwrap();

        let later = now + chrono::Duration::seconds(10);
        tier.get("k", later).unwrap();
        tier.get("k", later).unwrap();

        let entry = tier.entry("k").unwrap().unwrap();
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.last_access.timestamp_millis(), later.timestamp_millis());
        assert_eq!(entry.tier, CacheTier::Embedded);
    }

    #[test]
    fn test_expiration() {
        let (tier, _dir) = test_tier();
        let now = Utc::now();

        // Store with 0 TTL (immediately expired)
        tier.put("key3", "\"data\"", Duration::from_secs(0), now)
            .unwrap();

        assert_eq!(tier.get("key3", now).unwrap(), None);
        assert_eq!(tier.purge_expired(now).unwrap(), 1);
    }

    #[test]
    fn test_corrupt_row_is_an_error() {
        let (tier, _dir) = test_tier();
        let now = Utc::now();
        tier.put("bad", "{not json", Duration::from_secs(60), now)
            .unwrap();

        assert!(matches!(
            tier.get("bad", now),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_delete_and_clear_all() {
        let (tier, _dir) = test_tier();
        let now = Utc::now();
        tier.put("k1", "1", Duration::from_secs(60), now).unwrap();
        tier.put("k2", "2", Duration::from_secs(60), now).unwrap();
        tier.put("k3", "3", Duration::from_secs(60), now).unwrap();

        assert!(tier.delete("k1").unwrap());
        assert!(!tier.delete("k1").unwrap());

        let stats = tier.clear_all().unwrap();
        assert_eq!(stats.entries_removed, 2);
        assert!(tier.get("k2", now).unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let (tier, _dir) = test_tier();
        let now = Utc::now();

        tier.put("k1", "\"data1\"", Duration::from_secs(60), now)
            .unwrap();
        tier.put("k2", "\"data2\"", Duration::from_secs(0), now)
            .unwrap();

        let stats = tier.stats(now).unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.valid_entries, 1);
        assert_eq!(stats.expired_entries, 1);
        assert!(stats.total_size_bytes > 0);
        assert!(stats.oldest_entry.is_some());
        assert_eq!(tier.live_count(now).unwrap(), 1);
    }
}
