//! Checkpoint stores: per-key watermarks for incremental pulls.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

use fieldsync_common::{Error, Result};

/// Key-value store of last-seen server timestamps.
///
/// Stores are dumb: they persist whatever they are given. Monotonic
/// advancement and clock-skew clamping live with the callers.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()>;

    async fn clear(&self, key: &str) -> Result<()>;

    async fn clear_all(&self) -> Result<()>;

    /// All checkpoints ordered by key.
    async fn entries(&self) -> Result<Vec<(String, DateTime<Utc>)>>;
}

/// Checkpoints held in memory. Lost on drop.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    values: RwLock<BTreeMap<String, DateTime<Utc>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("checkpoint lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.values.read().map_err(poisoned)?.get(key).copied())
    }

    async fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.values
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.values.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.values.write().map_err(poisoned)?.clear();
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        Ok(self
            .values
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}

fn sqlite_err(err: rusqlite::Error) -> Error {
    Error::Storage(format!("sqlite: {}", err))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Storage(format!("invalid checkpoint timestamp {}", millis)))
}

/// Checkpoints persisted in SQLite so they survive restarts.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Create or open a checkpoint database.
    ///
    /// # Errors
    /// - Database creation or schema failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sqlite_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                key TEXT PRIMARY KEY,
                updated_at_ms INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_err)?;

        info!("Checkpoint store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(poisoned)?;
        f(&conn).map_err(sqlite_err)
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let millis = self.with_conn(|conn| {
            match conn.query_row(
                "SELECT updated_at_ms FROM sync_checkpoints WHERE key = ?1",
                [key],
                |row| row.get::<_, i64>(0),
            ) {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        millis.map(from_millis).transpose()
    }

    async fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        debug!("Checkpoint {} -> {}", key, value);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_checkpoints (key, updated_at_ms) VALUES (?1, ?2)",
                params![key, value.timestamp_millis()],
            )
            .map(|_| ())
        })
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sync_checkpoints WHERE key = ?1", [key])
                .map(|_| ())
        })
    }

    async fn clear_all(&self) -> Result<()> {
        info!("Clearing all checkpoints");
        self.with_conn(|conn| conn.execute("DELETE FROM sync_checkpoints", []).map(|_| ()))
    }

    async fn entries(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, updated_at_ms FROM sync_checkpoints ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        rows.into_iter()
            .map(|(key, millis)| Ok((key, from_millis(millis)?)))
            .collect()
    }
}
