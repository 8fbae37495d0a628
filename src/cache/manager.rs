//! Two-tier cache: a short-lived in-memory layer in front of one store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::traits::{CacheRecord, CacheStats, CacheStore};
use crate::error::{Error, Result};

/// Stand-in deadline for lifetimes too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Deadline `ttl` from now, clamped for lifetimes like `Duration::MAX`.
pub(crate) fn deadline_after(ttl: Duration) -> Instant {
  let now = Instant::now();
  now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Free-form metadata attached to cached values.
pub type Metadata = serde_json::Map<String, Value>;

/// Read policy, governing the order of cache and remote lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
  #[default]
  CacheFirst,
  NetworkFirst,
  CacheOnly,
  NetworkOnly,
}

impl fmt::Display for CachePolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::CacheOnly => "cache-only",
      Self::NetworkOnly => "network-only",
    };
    f.write_str(name)
  }
}

impl FromStr for CachePolicy {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "cache-first" => Ok(Self::CacheFirst),
      "network-first" => Ok(Self::NetworkFirst),
      "cache-only" => Ok(Self::CacheOnly),
      "network-only" => Ok(Self::NetworkOnly),
      other => Err(Error::InvalidRequest(format!("unknown cache policy '{other}'"))),
    }
  }
}

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  /// In-memory layer
  Memory,
  /// Persistent store
  Storage,
  /// Fetched from the remote
  Network,
}

/// A value read from the cache, with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
  pub value: T,
  pub metadata: Metadata,
  pub source: Source,
}

/// Options for [`CacheManager::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
  /// Lifetime in the memory layer; the manager default when `None`.
  pub ttl: Option<Duration>,
  pub metadata: Metadata,
}

/// Memory-layer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
  pub count: u64,
  /// Approximate, measured as serialized JSON length.
  pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
  pub memory: MemoryStats,
  pub storage: CacheStats,
}

/// Persisted form of a value.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  value: Value,
  metadata: Metadata,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
  value: Value,
  metadata: Metadata,
  expires_at: Instant,
}

/// Two-tier cache over a [`CacheStore`].
pub struct CacheManager {
  store: Arc<dyn CacheStore>,
  memory: Mutex<HashMap<String, MemoryEntry>>,
  default_ttl: Duration,
  pruner: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
  pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
    Self {
      store,
      memory: Mutex::new(HashMap::new()),
      default_ttl,
      pruner: Mutex::new(None),
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn memory(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
    self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Read `key` under `policy`.
  ///
  /// This layer never talks to the network, so `network-first` and
  /// `network-only` behave like `cache-first`; remote lookups belong to
  /// [`crate::repository::Repository`].
  pub fn get<T: DeserializeOwned>(&self, key: &str, policy: CachePolicy) -> Result<Option<CachedValue<T>>> {
    match policy {
      CachePolicy::CacheFirst
      | CachePolicy::CacheOnly
      | CachePolicy::NetworkFirst
      | CachePolicy::NetworkOnly => self.get_cache_first(key),
    }
  }

  fn get_cache_first<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CachedValue<T>>> {
    // Check the memory layer first
    let hit = {
      let mut memory = self.memory();
      let now = Instant::now();
      match memory.get(key).map(|e| (e.expires_at > now, e.clone())) {
        Some((true, entry)) => Some(entry),
        Some((false, _)) => {
          memory.remove(key);
          None
        }
        None => None,
      }
    };
    if let Some(entry) = hit {
      return Ok(Some(CachedValue {
        value: serde_json::from_value(entry.value)?,
        metadata: entry.metadata,
        source: Source::Memory,
      }));
    }

    let Some(record) = self.store.get(key)? else {
      return Ok(None);
    };

    let envelope: Envelope = match serde_json::from_slice(&record.payload) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(key, error = %e, "dropping unreadable cache entry");
        self.store.delete(key)?;
        return Ok(None);
      }
    };

    // Backfill the memory layer
    self.memory().insert(
      key.to_string(),
      MemoryEntry {
        value: envelope.value.clone(),
        metadata: envelope.metadata.clone(),
        expires_at: deadline_after(self.default_ttl),
      },
    );

    Ok(Some(CachedValue {
      value: serde_json::from_value(envelope.value)?,
      metadata: envelope.metadata,
      source: Source::Storage,
    }))
  }

  /// Write `value` to both tiers. Returns the metadata that was stored.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, options: SetOptions) -> Result<Metadata> {
    let ttl = options.ttl.unwrap_or(self.default_ttl);
    let now = Utc::now().timestamp_millis();
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

    let mut metadata = options.metadata;
    metadata.insert("cachedAt".to_string(), Value::from(now));
    metadata.insert("ttl".to_string(), Value::from(ttl_ms));

    let value = serde_json::to_value(value)?;

    self.memory().insert(
      key.to_string(),
      MemoryEntry {
        value: value.clone(),
        metadata: metadata.clone(),
        expires_at: deadline_after(ttl),
      },
    );

    let envelope = Envelope {
      value,
      metadata: metadata.clone(),
    };
    let payload = serde_json::to_vec(&envelope)?;
    self.store.put(CacheRecord::bare(key, payload, now))?;

    debug!(key, ttl_ms, "cached value");
    Ok(metadata)
  }

  /// Remove `key` from both tiers. Returns whether the store held it.
  pub fn delete(&self, key: &str) -> Result<bool> {
    self.memory().remove(key);
    Ok(self.store.delete(key)?)
  }

  pub fn clear(&self) -> Result<()> {
    self.memory().clear();
    self.store.clear_all()?;
    Ok(())
  }

  /// Persistent keys matching a `*` pattern.
  pub fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
    Ok(self.store.keys(pattern)?)
  }

  /// Drop expired memory entries. Returns how many were removed.
  pub fn prune_memory(&self) -> usize {
    let now = Instant::now();
    let mut memory = self.memory();
    let before = memory.len();
    memory.retain(|_, entry| entry.expires_at > now);
    before - memory.len()
  }

  /// Prune the memory layer every `every` on a background task. No-op for a
  /// zero interval or when already running.
  pub fn start_pruning(self: &Arc<Self>, every: Duration) {
    if every.is_zero() {
      return;
    }
    let mut pruner = self.pruner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if pruner.is_some() {
      return;
    }

    let cache = Arc::downgrade(self);
    *pruner = Some(tokio::spawn(async move {
      let mut ticker = interval_at(deadline_after(every), every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
          break;
        };
        let removed = cache.prune_memory();
        if removed > 0 {
          debug!(removed, "pruned expired memory entries");
        }
      }
    }));
    info!(interval_ms = every.as_millis() as u64, "memory pruning started");
  }

  pub fn stop_pruning(&self) {
    let task = self
      .pruner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(task) = task {
      task.abort();
    }
  }

  pub fn get_stats(&self) -> Result<ManagerStats> {
    let memory = {
      let memory = self.memory();
      MemoryStats {
        count: memory.len() as u64,
        size: memory
          .values()
          .map(|e| serde_json::to_vec(&e.value).map(|v| v.len() as u64).unwrap_or(0))
          .sum(),
      }
    };

    Ok(ManagerStats {
      memory,
      storage: self.store.stats()?,
    })
  }
}

impl Drop for CacheManager {
  fn drop(&mut self) {
    if let Ok(mut task) = self.pruner.lock() {
      if let Some(task) = task.take() {
        task.abort();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use serde_json::json;

  fn manager() -> (CacheManager, Arc<MemoryStorage>) {
    let store = Arc::new(MemoryStorage::new(1024 * 1024));
    (CacheManager::new(store.clone(), Duration::from_secs(300)), store)
  }

  #[test]
  fn test_set_then_get_hits_memory() {
    let (cache, _) = manager();
    cache.set("user:1", &json!({"name": "Ada"}), SetOptions::default()).unwrap();

    let hit = cache.get::<Value>("user:1", CachePolicy::CacheFirst).unwrap().unwrap();
    assert_eq!(hit.value, json!({"name": "Ada"}));
    assert_eq!(hit.source, Source::Memory);
    assert!(hit.metadata.contains_key("cachedAt"));
    assert_eq!(hit.metadata["ttl"], json!(300_000));
  }

  #[test]
  fn test_miss_returns_none() {
    let (cache, _) = manager();
    assert!(cache.get::<Value>("nope", CachePolicy::CacheFirst).unwrap().is_none());
  }

  #[test]
  fn test_storage_hit_backfills_memory() {
    let (cache, store) = manager();
    cache.set("k", &42u32, SetOptions::default()).unwrap();

    // A fresh manager over the same store starts with an empty memory layer.
    let other = CacheManager::new(store, Duration::from_secs(60));
    let first = other.get::<u32>("k", CachePolicy::CacheFirst).unwrap().unwrap();
    assert_eq!(first.value, 42);
    assert_eq!(first.source, Source::Storage);

    let second = other.get::<u32>("k", CachePolicy::CacheFirst).unwrap().unwrap();
    assert_eq!(second.source, Source::Memory);
  }

  #[test]
  fn test_expired_memory_entry_falls_through_to_storage() {
    let (cache, _) = manager();
    let options = SetOptions {
      ttl: Some(Duration::ZERO),
      ..Default::default()
    };
    cache.set("k", &"v", options).unwrap();

    let hit = cache.get::<String>("k", CachePolicy::CacheOnly).unwrap().unwrap();
    assert_eq!(hit.source, Source::Storage);
    assert_eq!(hit.value, "v");
  }

  #[test]
  fn test_caller_metadata_is_kept_but_cannot_override_bookkeeping() {
    let (cache, _) = manager();
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!("local"));
    metadata.insert("ttl".to_string(), json!("bogus"));
    let options = SetOptions {
      ttl: Some(Duration::from_secs(5)),
      metadata,
    };

    let stored = cache.set("k", &1, options).unwrap();
    assert_eq!(stored["source"], json!("local"));
    assert_eq!(stored["ttl"], json!(5000));
  }

  #[test]
  fn test_network_policies_alias_cache_first() {
    let (cache, _) = manager();
    cache.set("k", &"v", SetOptions::default()).unwrap();
    for policy in [CachePolicy::NetworkFirst, CachePolicy::NetworkOnly] {
      let hit = cache.get::<String>("k", policy).unwrap().unwrap();
      assert_eq!(hit.value, "v");
    }
  }

  #[test]
  fn test_delete_and_clear_cascade() {
    let (cache, store) = manager();
    cache.set("a", &1, SetOptions::default()).unwrap();
    cache.set("b", &2, SetOptions::default()).unwrap();

    assert!(cache.delete("a").unwrap());
    assert!(cache.get::<i32>("a", CachePolicy::CacheFirst).unwrap().is_none());
    assert!(store.get("a").unwrap().is_none());

    cache.clear().unwrap();
    assert!(cache.get::<i32>("b", CachePolicy::CacheFirst).unwrap().is_none());
    assert_eq!(cache.get_stats().unwrap(), ManagerStats::default());
  }

  #[test]
  fn test_stats_cover_both_tiers() {
    let (cache, _) = manager();
    cache.set("a", &"xyz", SetOptions::default()).unwrap();
    let stats = cache.get_stats().unwrap();
    assert_eq!(stats.memory.count, 1);
    assert_eq!(stats.memory.size, 5);
    assert_eq!(stats.storage.count, 1);
    assert!(stats.storage.total_bytes > 0);
  }

  #[test]
  fn test_prune_memory() {
    let (cache, _) = manager();
    let short = SetOptions {
      ttl: Some(Duration::ZERO),
      ..Default::default()
    };
    cache.set("gone", &1, short).unwrap();
    cache.set("kept", &2, SetOptions::default()).unwrap();
    assert_eq!(cache.prune_memory(), 1);
    assert_eq!(cache.get_stats().unwrap().memory.count, 1);
  }

  #[test]
  fn test_unbounded_ttl_never_expires() {
    let (cache, _) = manager();
    let forever = SetOptions {
      ttl: Some(Duration::MAX),
      ..Default::default()
    };
    let stored = cache.set("k", &1, forever).unwrap();
    assert_eq!(stored["ttl"], json!(u64::MAX));

    let hit = cache.get::<i32>("k", CachePolicy::CacheFirst).unwrap().unwrap();
    assert_eq!(hit.source, Source::Memory);
    assert_eq!(cache.prune_memory(), 0);

    // The same applies when the manager default is unbounded.
    let other = CacheManager::new(Arc::new(MemoryStorage::new(1024)), Duration::MAX);
    other.set("k", &2, SetOptions::default()).unwrap();
    assert_eq!(other.get::<i32>("k", CachePolicy::CacheFirst).unwrap().unwrap().value, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_background_pruning_drops_unread_entries() {
    let store = Arc::new(MemoryStorage::new(1024 * 1024));
    let cache = Arc::new(CacheManager::new(store, Duration::from_secs(300)));
    let short = SetOptions {
      ttl: Some(Duration::from_secs(1)),
      ..Default::default()
    };
    cache.set("brief", &1, short).unwrap();
    cache.set("kept", &2, SetOptions::default()).unwrap();

    cache.start_pruning(Duration::from_secs(10));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(cache.get_stats().unwrap().memory.count, 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let stats = cache.get_stats().unwrap();
    assert_eq!(stats.memory.count, 1);
    assert_eq!(stats.storage.count, 2);

    cache.stop_pruning();
  }

  #[test]
  fn test_unreadable_entry_is_dropped() {
    let (cache, store) = manager();
    store.put(CacheRecord::bare("bad", b"not json".to_vec(), 1)).unwrap();
    assert!(cache.get::<Value>("bad", CachePolicy::CacheFirst).unwrap().is_none());
    assert!(store.get("bad").unwrap().is_none());
  }

  #[test]
  fn test_policy_parse() {
    assert_eq!("network-only".parse::<CachePolicy>().unwrap(), CachePolicy::NetworkOnly);
    assert!("sometimes".parse::<CachePolicy>().is_err());
    assert_eq!(CachePolicy::default().to_string(), "cache-first");
  }
}
