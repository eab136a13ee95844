//! Embedded SQLite store shared by the cache, health detector and local store
//!
//! All timestamps are stored as Unix milliseconds.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::config::StorageConfig;
use crate::error::CacheError;

/// Schema version - increment to trigger nuke-and-rebuild
const SCHEMA_VERSION: i32 = 2;

const DB_FILE: &str = "keystone.db";

type Result<T> = std::result::Result<T, CacheError>;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        size INTEGER NOT NULL,
        access_time INTEGER NOT NULL,
        hit_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
    CREATE INDEX IF NOT EXISTS idx_cache_access ON cache_entries(access_time);

    CREATE TABLE IF NOT EXISTS external_service_status (
        service_name TEXT PRIMARY KEY NOT NULL,
        display_name TEXT NOT NULL,
        is_available INTEGER NOT NULL,
        last_check INTEGER NOT NULL,
        failure_count INTEGER NOT NULL,
        response_time_ms INTEGER NOT NULL,
        circuit_breaker_state TEXT,
        last_error TEXT,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS vulnerability_data (
        vuln_id TEXT NOT NULL,
        source TEXT NOT NULL,
        raw_payload TEXT NOT NULL,
        cache_expires_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (vuln_id, source)
    );

    CREATE INDEX IF NOT EXISTS idx_vuln_expires ON vulnerability_data(cache_expires_at);
"#;

/// Handle to the embedded database.
///
/// SQLite connections are not `Sync`, so the connection sits behind a mutex
/// and is shared through `Arc<Database>`. The lock is never held across an
/// `.await`.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open the database described by the storage config.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        match &config.path {
            Some(dir) => Self::open_at(dir),
            None => Self::open_at(&Self::default_dir()?),
        }
    }

    /// Default data directory (~/.cache/keystone on Linux)
    pub fn default_dir() -> Result<PathBuf> {
        let cache_base = dirs::cache_dir().ok_or(CacheError::NoHome)?;
        Ok(cache_base.join("keystone"))
    }

    /// Open or create the database inside `dir`.
    pub fn open_at(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CacheError::Io(format!("Failed to create data dir: {}", e)))?;

        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;

        // Check schema version - nuke if mismatched
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap_or(0);

        if version != 0 && version != SCHEMA_VERSION {
            log::info!(
                "Database schema version mismatch ({} != {}), rebuilding",
                version,
                SCHEMA_VERSION
            );
            drop(conn);
            std::fs::remove_file(&db_path)
                .map_err(|e| CacheError::Io(format!("Failed to remove database: {}", e)))?;
            return Self::open_at(dir);
        }

        Self::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path),
        })
    }

    /// Private in-memory database (tests, ephemeral runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.lock();
        Ok(f(&mut conn)?)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }
}
