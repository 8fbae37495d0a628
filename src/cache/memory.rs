//! In-process cache backend with byte accounting.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::traits::{glob_match, CacheRecord, CacheStats, CacheStore};
use crate::error::StorageError;

#[derive(Debug)]
struct Slot {
  /// Insertion order, kept across overwrites.
  seq: u64,
  record: CacheRecord,
}

#[derive(Debug, Default)]
struct Inner {
  slots: HashMap<String, Slot>,
  total_bytes: u64,
  next_seq: u64,
}

impl Inner {
  /// Slots ordered oldest first.
  fn by_age(&self) -> Vec<(&String, &Slot)> {
    let mut slots: Vec<_> = self.slots.iter().collect();
    slots.sort_by_key(|(_, s)| (s.record.created_at, s.seq));
    slots
  }

  fn remove(&mut self, key: &str) -> bool {
    match self.slots.remove(key) {
      Some(slot) => {
        self.total_bytes = self.total_bytes.saturating_sub(slot.record.size_bytes());
        true
      }
      None => false,
    }
  }

  fn enforce_max_bytes(&mut self, max_bytes: u64) -> usize {
    if self.total_bytes <= max_bytes {
      return 0;
    }

    let victims: Vec<String> = self.by_age().into_iter().map(|(k, _)| k.clone()).collect();
    let mut evicted = 0;
    for key in victims {
      if self.total_bytes <= max_bytes {
        break;
      }
      self.remove(&key);
      evicted += 1;
    }
    evicted
  }
}

/// Session-scoped store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStorage {
  max_bytes: u64,
  inner: Mutex<Inner>,
}

impl MemoryStorage {
  pub fn new(max_bytes: u64) -> Self {
    Self {
      max_bytes,
      inner: Mutex::new(Inner::default()),
    }
  }

  pub fn max_bytes(&self) -> u64 {
    self.max_bytes
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
    self.inner.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl CacheStore for MemoryStorage {
  fn init(&self) -> Result<(), StorageError> {
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<CacheRecord>, StorageError> {
    let inner = self.lock()?;
    Ok(inner.slots.get(key).map(|s| s.record.clone()))
  }

  fn put(&self, record: CacheRecord) -> Result<(), StorageError> {
    let mut inner = self.lock()?;

    let size = record.size_bytes();
    let previous = inner
      .slots
      .get(&record.key)
      .map(|s| (s.record.size_bytes(), s.seq));
    let seq = match previous {
      Some((old_size, seq)) => {
        inner.total_bytes = inner.total_bytes.saturating_sub(old_size);
        seq
      }
      None => {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        seq
      }
    };

    inner.slots.insert(record.key.clone(), Slot { seq, record });
    inner.total_bytes += size;

    let evicted = inner.enforce_max_bytes(self.max_bytes);
    if evicted > 0 {
      debug!(evicted, total_bytes = inner.total_bytes, "memory cache evicted oldest records");
    }
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    Ok(self.lock()?.remove(key))
  }

  fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError> {
    let inner = self.lock()?;
    Ok(
      inner
        .by_age()
        .into_iter()
        .map(|(k, _)| k)
        .filter(|k| pattern.map_or(true, |p| glob_match(p, k)))
        .cloned()
        .collect(),
    )
  }

  fn stats(&self) -> Result<CacheStats, StorageError> {
    let inner = self.lock()?;
    Ok(CacheStats {
      count: inner.slots.len() as u64,
      total_bytes: inner.total_bytes,
    })
  }

  fn clear_all(&self) -> Result<(), StorageError> {
    let mut inner = self.lock()?;
    inner.slots.clear();
    inner.total_bytes = 0;
    Ok(())
  }

  fn clear_expired(&self, before_ts: i64) -> Result<usize, StorageError> {
    let mut inner = self.lock()?;
    let expired: Vec<String> = inner
      .slots
      .iter()
      .filter(|(_, s)| s.record.created_at < before_ts)
      .map(|(k, _)| k.clone())
      .collect();

    for key in &expired {
      inner.remove(key);
    }
    Ok(expired.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(key: &str, size: usize, created_at: i64) -> CacheRecord {
    CacheRecord::bare(key, vec![7; size], created_at)
  }

  #[test]
  fn test_round_trip() {
    let store = MemoryStorage::new(1024);
    let mut r = record("a", 4, 1);
    r.text = "hello".to_string();
    r.mime_type = Some("audio/wav".to_string());
    store.put(r.clone()).unwrap();
    assert_eq!(store.get("a").unwrap(), Some(r));
    assert_eq!(store.get("missing").unwrap(), None);
  }

  #[test]
  fn test_overwrite_does_not_double_count() {
    let store = MemoryStorage::new(1024);
    store.put(record("a", 10, 1)).unwrap();
    store.put(record("a", 4, 2)).unwrap();
    assert_eq!(store.stats().unwrap(), CacheStats { count: 1, total_bytes: 4 });
  }

  #[test]
  fn test_eviction_oldest_first() {
    let store = MemoryStorage::new(5);
    store.put(record("a", 3, 1)).unwrap();
    store.put(record("b", 3, 2)).unwrap();
    assert!(store.get("a").unwrap().is_none());
    assert!(store.get("b").unwrap().is_some());
    assert_eq!(store.stats().unwrap(), CacheStats { count: 1, total_bytes: 3 });
  }

  #[test]
  fn test_eviction_ties_follow_insertion_order() {
    let store = MemoryStorage::new(6);
    store.put(record("first", 2, 5)).unwrap();
    store.put(record("second", 2, 5)).unwrap();
    store.put(record("third", 2, 5)).unwrap();
    store.put(record("fourth", 2, 5)).unwrap();
    assert!(store.get("first").unwrap().is_none());
    assert!(store.get("second").unwrap().is_some());
    assert!(store.get("fourth").unwrap().is_some());
  }

  #[test]
  fn test_oversized_record_is_evicted_too() {
    let store = MemoryStorage::new(4);
    store.put(record("small", 2, 1)).unwrap();
    store.put(record("huge", 10, 2)).unwrap();
    assert_eq!(store.stats().unwrap(), CacheStats::default());
  }

  #[test]
  fn test_clear_expired() {
    let store = MemoryStorage::new(1024);
    store.put(record("t100", 1, 100)).unwrap();
    store.put(record("t200", 1, 200)).unwrap();
    store.put(record("t300", 1, 300)).unwrap();

    assert_eq!(store.clear_expired(150).unwrap(), 1);
    assert!(store.get("t100").unwrap().is_none());
    assert!(store.get("t200").unwrap().is_some());
    assert!(store.get("t300").unwrap().is_some());
    assert_eq!(store.stats().unwrap().total_bytes, 2);
  }

  #[test]
  fn test_keys_with_pattern() {
    let store = MemoryStorage::new(1024);
    store.put(record("user:2", 1, 2)).unwrap();
    store.put(record("user:1", 1, 1)).unwrap();
    store.put(record("post:1", 1, 3)).unwrap();

    assert_eq!(store.keys(Some("user:*")).unwrap(), vec!["user:1", "user:2"]);
    assert_eq!(store.keys(None).unwrap().len(), 3);
  }

  #[test]
  fn test_delete_and_clear() {
    let store = MemoryStorage::new(1024);
    store.put(record("a", 2, 1)).unwrap();
    store.put(record("b", 2, 1)).unwrap();
    assert!(store.delete("a").unwrap());
    assert!(!store.delete("a").unwrap());
    assert_eq!(store.stats().unwrap().total_bytes, 2);

    store.clear_all().unwrap();
    assert_eq!(store.stats().unwrap(), CacheStats::default());
  }
}
