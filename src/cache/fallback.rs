//! Store that prefers SQLite and degrades to memory for the rest of the
//! session on the first persistent failure.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

use super::memory::MemoryStorage;
use super::storage::{SqliteStorage, Table};
use super::traits::{CacheRecord, CacheStats, CacheStore};
use crate::error::StorageError;

/// Which backend a [`FallbackStore`] is currently serving from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
  Persistent,
  Transient,
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Persistent => f.write_str("persistent"),
      Self::Transient => f.write_str("transient"),
    }
  }
}

enum Backend {
  Persistent(SqliteStorage),
  Transient(MemoryStorage),
}

impl Backend {
  fn store(&self) -> &dyn CacheStore {
    match self {
      Self::Persistent(s) => s as &dyn CacheStore,
      Self::Transient(m) => m as &dyn CacheStore,
    }
  }
}

/// Options for opening a [`FallbackStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// Database file; `None` uses [`SqliteStorage::default_path`].
  pub path: Option<PathBuf>,
  pub table: Table,
  pub max_bytes: u64,
  /// Skip the persistent backend entirely.
  pub force_memory: bool,
}

impl StoreOptions {
  pub fn new(table: Table, max_bytes: u64) -> Self {
    Self {
      path: None,
      table,
      max_bytes,
      force_memory: false,
    }
  }
}

/// Cache store with a one-way, session-scoped degradation from the persistent
/// backend to the transient one.
pub struct FallbackStore {
  backend: Mutex<Backend>,
  max_bytes: u64,
}

impl FallbackStore {
  /// Open the persistent backend, or fall back to memory if that fails.
  pub fn open(options: &StoreOptions) -> Self {
    let backend = if options.force_memory {
      info!(table = options.table.name(), "cache running in memory mode");
      Backend::Transient(MemoryStorage::new(options.max_bytes))
    } else {
      match Self::open_persistent(options) {
        Ok(storage) => Backend::Persistent(storage),
        Err(e) => {
          warn!(error = %e, table = options.table.name(), "persistent cache unavailable, using memory for this session");
          Backend::Transient(MemoryStorage::new(options.max_bytes))
        }
      }
    };

    Self {
      backend: Mutex::new(backend),
      max_bytes: options.max_bytes,
    }
  }

  fn open_persistent(options: &StoreOptions) -> Result<SqliteStorage, StorageError> {
    let path = match &options.path {
      Some(p) => p.clone(),
      None => SqliteStorage::default_path()?,
    };
    SqliteStorage::open(&path, options.table, options.max_bytes)
  }

  pub fn backend(&self) -> BackendKind {
    match &*self.lock() {
      Backend::Persistent(_) => BackendKind::Persistent,
      Backend::Transient(_) => BackendKind::Transient,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Backend> {
    // A panic inside a backend call leaves the backend itself consistent
    // (SQLite statements are atomic, memory updates finish before unlock).
    self.backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Run `op` on the active backend. A persistent failure swaps in a fresh
  /// memory backend and reruns `op` there.
  fn run<T>(&self, op_name: &str, op: impl Fn(&dyn CacheStore) -> Result<T, StorageError>) -> Result<T, StorageError> {
    let mut backend = self.lock();
    match op(backend.store()) {
      Ok(value) => Ok(value),
      Err(e) => {
        if let Backend::Persistent(storage) = &*backend {
          warn!(
            error = %e,
            op = op_name,
            path = %storage.path().display(),
            "persistent cache failed, switching to memory for the rest of the session"
          );
          *backend = Backend::Transient(MemoryStorage::new(self.max_bytes));
          op(backend.store())
        } else {
          Err(e)
        }
      }
    }
  }
}

impl CacheStore for FallbackStore {
  fn init(&self) -> Result<(), StorageError> {
    self.run("init", |s| s.init())
  }

  fn get(&self, key: &str) -> Result<Option<CacheRecord>, StorageError> {
    self.run("get", |s| s.get(key))
  }

  fn put(&self, record: CacheRecord) -> Result<(), StorageError> {
    self.run("put", |s| s.put(record.clone()))
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    self.run("delete", |s| s.delete(key))
  }

  fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError> {
    self.run("keys", |s| s.keys(pattern))
  }

  fn stats(&self) -> Result<CacheStats, StorageError> {
    self.run("stats", |s| s.stats())
  }

  fn clear_all(&self) -> Result<(), StorageError> {
    self.run("clear_all", |s| s.clear_all())
  }

  fn clear_expired(&self, before_ts: i64) -> Result<usize, StorageError> {
    self.run("clear_expired", |s| s.clear_expired(before_ts))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rusqlite::Connection;
  use tempfile::TempDir;

  fn options(dir: &TempDir) -> StoreOptions {
    StoreOptions {
      path: Some(dir.path().join("cache.db")),
      ..StoreOptions::new(Table::Audio, 1024)
    }
  }

  #[test]
  fn test_opens_persistent_when_available() {
    let dir = TempDir::new().unwrap();
    let store = FallbackStore::open(&options(&dir));
    assert_eq!(store.backend(), BackendKind::Persistent);
  }

  #[test]
  fn test_force_memory_skips_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = FallbackStore::open(&StoreOptions {
      force_memory: true,
      ..options(&dir)
    });
    assert_eq!(store.backend(), BackendKind::Transient);
    assert!(!dir.path().join("cache.db").exists());
  }

  #[test]
  fn test_init_failure_falls_back_to_memory() {
    let dir = TempDir::new().unwrap();
    // A regular file where a directory is needed makes the open fail.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let store = FallbackStore::open(&StoreOptions {
      path: Some(blocker.join("cache.db")),
      ..StoreOptions::new(Table::Audio, 1024)
    });
    assert_eq!(store.backend(), BackendKind::Transient);

    store.put(CacheRecord::bare("k", vec![1, 2], 1)).unwrap();
    assert!(store.get("k").unwrap().is_some());
  }

  #[test]
  fn test_runtime_failure_flips_permanently() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir);
    let store = FallbackStore::open(&opts);
    store.put(CacheRecord::bare("before", vec![1], 1)).unwrap();

    // Break the table behind the store's back.
    let conn = Connection::open(opts.path.as_ref().unwrap()).unwrap();
    conn.execute_batch("DROP TABLE audio_cache;").unwrap();

    // The failing read is served from the fresh memory backend.
    assert_eq!(store.get("before").unwrap(), None);
    assert_eq!(store.backend(), BackendKind::Transient);

    // Repairing the database does not bring the persistent backend back.
    SqliteStorage::open(opts.path.as_ref().unwrap(), Table::Audio, 1024).unwrap();
    store.put(CacheRecord::bare("after", vec![1, 2, 3], 2)).unwrap();
    assert_eq!(store.backend(), BackendKind::Transient);
    assert_eq!(store.stats().unwrap(), CacheStats { count: 1, total_bytes: 3 });
  }

  #[test]
  fn test_budget_carries_over_to_memory() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();

    let store = FallbackStore::open(&StoreOptions {
      path: Some(blocker.join("cache.db")),
      ..StoreOptions::new(Table::Audio, 5)
    });
    store.put(CacheRecord::bare("a", vec![0; 3], 1)).unwrap();
    store.put(CacheRecord::bare("b", vec![0; 3], 2)).unwrap();
    assert_eq!(store.stats().unwrap(), CacheStats { count: 1, total_bytes: 3 });
  }
}
