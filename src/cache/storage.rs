//! SQLite-backed persistent cache storage.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::traits::{glob_to_sql, CacheRecord, CacheStats, CacheStore};
use crate::error::StorageError;

/// Tables a [`SqliteStorage`] can own. Each store instance owns exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
  /// Generated audio, keyed by derived request keys.
  Audio,
  /// Generic entries written through the cache manager.
  Entries,
}

impl Table {
  pub fn name(self) -> &'static str {
    match self {
      Self::Audio => "audio_cache",
      Self::Entries => "kv_cache",
    }
  }
}

/// Schema for a cache table. `{table}` is substituted with [`Table::name`].
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
    key TEXT PRIMARY KEY,
    text TEXT NOT NULL DEFAULT '',
    voice_style TEXT NOT NULL DEFAULT '',
    lang TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    schema_version TEXT NOT NULL DEFAULT '',
    mime_type TEXT,
    created_at INTEGER NOT NULL,
    size INTEGER NOT NULL,
    payload BLOB NOT NULL
);

-- Supports oldest-first eviction and expiry sweeps
CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table}(created_at);
"#;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  table: Table,
  max_bytes: u64,
  path: PathBuf,
}

impl SqliteStorage {
  /// Open (creating if needed) the database at `path` and run migrations.
  pub fn open(path: &Path, table: Table, max_bytes: u64) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StorageError::Directory {
        path: parent.display().to_string(),
        source,
      })?;
    }

    let conn = Connection::open(path).map_err(|source| StorageError::Open {
      path: path.display().to_string(),
      source,
    })?;

    let storage = Self {
      conn: Mutex::new(conn),
      table,
      max_bytes,
      path: path.to_path_buf(),
    };
    storage.init()?;

    info!(path = %path.display(), table = table.name(), "opened persistent cache");
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StorageError::NoDataDir)?;

    Ok(data_dir.join("parrot").join("cache.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }

  fn sql(&self, template: &str) -> String {
    template.replace("{table}", self.table.name())
  }

  /// Delete oldest records until the byte budget holds. Returns how many went.
  fn enforce_max_bytes(&self, conn: &Connection) -> Result<usize, StorageError> {
    let total: i64 = conn.query_row(
      &self.sql("SELECT IFNULL(SUM(size), 0) FROM {table}"),
      [],
      |row| row.get(0),
    )?;
    let mut running = total.max(0) as u64;
    if running <= self.max_bytes {
      return Ok(0);
    }

    let victims: Vec<(String, i64)> = {
      let mut stmt = conn.prepare(&self.sql(
        "SELECT key, size FROM {table} ORDER BY created_at ASC, rowid ASC",
      ))?;
      let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
      rows.collect::<Result<_, _>>()?
    };

    let mut evicted = 0;
    for (key, size) in victims {
      if running <= self.max_bytes {
        break;
      }
      conn.execute(&self.sql("DELETE FROM {table} WHERE key = ?1"), params![key])?;
      running = running.saturating_sub(size.max(0) as u64);
      evicted += 1;
    }

    Ok(evicted)
  }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
  Ok(CacheRecord {
    key: row.get(0)?,
    text: row.get(1)?,
    voice_style: row.get(2)?,
    lang: row.get(3)?,
    provider: row.get(4)?,
    version: row.get(5)?,
    schema_version: row.get(6)?,
    mime_type: row.get(7)?,
    created_at: row.get(8)?,
    payload: row.get(9)?,
  })
}

impl CacheStore for SqliteStorage {
  fn init(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute_batch(&self.sql(CACHE_SCHEMA))?;
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<CacheRecord>, StorageError> {
    let conn = self.lock()?;
    let record = conn
      .query_row(
        &self.sql(
          "SELECT key, text, voice_style, lang, provider, version, schema_version, mime_type, created_at, payload
           FROM {table} WHERE key = ?1",
        ),
        params![key],
        record_from_row,
      )
      .optional()?;
    Ok(record)
  }

  fn put(&self, record: CacheRecord) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    // ON CONFLICT keeps the original rowid, so an overwritten key keeps its
    // place in the eviction order.
    tx.execute(
      &self.sql(
        "INSERT INTO {table} (key, text, voice_style, lang, provider, version, schema_version, mime_type, created_at, size, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(key) DO UPDATE SET
           text = excluded.text,
           voice_style = excluded.voice_style,
           lang = excluded.lang,
           provider = excluded.provider,
           version = excluded.version,
           schema_version = excluded.schema_version,
           mime_type = excluded.mime_type,
           created_at = excluded.created_at,
           size = excluded.size,
           payload = excluded.payload",
      ),
      params![
        record.key,
        record.text,
        record.voice_style,
        record.lang,
        record.provider,
        record.version,
        record.schema_version,
        record.mime_type,
        record.created_at,
        record.size_bytes() as i64,
        record.payload,
      ],
    )?;

    let evicted = self.enforce_max_bytes(&tx)?;
    tx.commit()?;

    if evicted > 0 {
      debug!(evicted, table = self.table.name(), "evicted oldest records");
    }
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(&self.sql("DELETE FROM {table} WHERE key = ?1"), params![key])?;
    Ok(removed > 0)
  }

  fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let keys = match pattern {
      Some(p) => {
        let mut stmt = conn.prepare(&self.sql(
          "SELECT key FROM {table} WHERE key GLOB ?1 ORDER BY created_at ASC, rowid ASC",
        ))?;
        let rows = stmt.query_map(params![glob_to_sql(p)], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>()?
      }
      None => {
        let mut stmt = conn.prepare(&self.sql(
          "SELECT key FROM {table} ORDER BY created_at ASC, rowid ASC",
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>()?
      }
    };
    Ok(keys)
  }

  fn stats(&self) -> Result<CacheStats, StorageError> {
    let conn = self.lock()?;
    let (count, total): (i64, i64) = conn.query_row(
      &self.sql("SELECT COUNT(*), IFNULL(SUM(size), 0) FROM {table}"),
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(CacheStats {
      count: count.max(0) as u64,
      total_bytes: total.max(0) as u64,
    })
  }

  fn clear_all(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(&self.sql("DELETE FROM {table}"), [])?;
    Ok(())
  }

  fn clear_expired(&self, before_ts: i64) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      &self.sql("DELETE FROM {table} WHERE created_at < ?1"),
      params![before_ts],
    )?;
    Ok(removed)
  }
}
