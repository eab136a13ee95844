//! Local authoritative vulnerability store
//!
//! Rows in `vulnerability_data` come from two places: operator seeding
//! (source `local`, kept regardless of expiry) and successful live fetches
//! (source named after the live provider, honoured until `cache_expires_at`).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;

use crate::clock::{Clock, SystemClock, expiry_after};
use crate::error::CacheError;
use crate::storage::Database;

/// Source tag of seeded records
pub const LOCAL_SOURCE: &str = "local";

/// How long a seeded record is advertised as fresh
const SEED_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

type Result<T> = std::result::Result<T, CacheError>;

/// Outcome of seeding a batch of records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Vulnerability rows in the embedded database
pub struct LocalStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Newest usable record for `vuln_id`: seeded rows always qualify,
    /// fetched rows only until they expire.
    pub fn lookup(&self, vuln_id: &str) -> Result<Option<Value>> {
        let now_ms = self.clock.now().timestamp_millis();

        let raw: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT raw_payload FROM vulnerability_data
                 WHERE vuln_id = ?1 AND (cache_expires_at > ?2 OR source = ?3)
                 ORDER BY updated_at DESC LIMIT 1",
                params![vuln_id, now_ms, LOCAL_SOURCE],
                |row| row.get(0),
            )
            .optional()
        })?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                CacheError::Serialization(format!("Corrupt local record {}: {}", vuln_id, e))
            })
        })
        .transpose()
    }

    /// Store one record fetched from `source`, replacing any earlier copy.
    pub fn record(&self, vuln_id: &str, source: &str, payload: &Value, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let expires = expiry_after(now, ttl).timestamp_millis();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO vulnerability_data
                 (vuln_id, source, raw_payload, cache_expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![vuln_id, source, payload.to_string(), expires, now.timestamp_millis()],
            )
        })?;
        Ok(())
    }

    /// Insert a batch of seed records in one transaction.
    ///
    /// Records that are not JSON objects or carry no string `cve_id`/`id`
    /// are skipped. Any database error rolls the whole batch back.
    pub fn seed(&self, records: &[Value]) -> Result<SeedReport> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let expires = expiry_after(now, SEED_TTL).timestamp_millis();

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut report = SeedReport::default();
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO vulnerability_data
                     (vuln_id, source, raw_payload, cache_expires_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;

                for (index, record) in records.iter().enumerate() {
                    let Some(vuln_id) = record_id(record) else {
                        warn!("Skipping seed record #{}: missing cve_id", index);
                        report.skipped += 1;
                        continue;
                    };

                    stmt.execute(params![
                        vuln_id,
                        LOCAL_SOURCE,
                        record.to_string(),
                        expires,
                        now_ms
                    ])?;
                    report.inserted += 1;
                }
            }
            tx.commit()?;

            debug!(
                "Seeded {} records ({} skipped)",
                report.inserted, report.skipped
            );
            Ok(report)
        })
    }

    /// Number of seeded records
    pub fn local_count(&self) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM vulnerability_data WHERE source = ?1",
                [LOCAL_SOURCE],
                |r| r.get(0),
            )
        })?;
        Ok(count as usize)
    }

    /// Number of fetched records that have not expired
    pub fn cached_count(&self) -> Result<usize> {
        let now_ms = self.clock.now().timestamp_millis();
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM vulnerability_data
                 WHERE source != ?1 AND cache_expires_at > ?2",
                params![LOCAL_SOURCE, now_ms],
                |r| r.get(0),
            )
        })?;
        Ok(count as usize)
    }
}

fn record_id(record: &Value) -> Option<&str> {
    let object = record.as_object()?;
    ["cve_id", "id"]
        .iter()
        .find_map(|field| object.get(*field).and_then(Value::as_str))
        .filter(|id| !id.trim().is_empty())
}
