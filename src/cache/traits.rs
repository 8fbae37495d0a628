//! Core types and the storage contract shared by all cache backends.

use serde::Serialize;

use crate::error::StorageError;

/// One stored entry. Replaced wholesale on a same-key `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
  pub key: String,
  pub text: String,
  pub voice_style: String,
  pub lang: String,
  pub provider: String,
  pub version: String,
  pub schema_version: String,
  pub mime_type: Option<String>,
  /// Milliseconds since the Unix epoch.
  pub created_at: i64,
  pub payload: Vec<u8>,
}

impl CacheRecord {
  /// Record with empty descriptive fields, for generic key/value use.
  pub fn bare(key: impl Into<String>, payload: Vec<u8>, created_at: i64) -> Self {
    Self {
      key: key.into(),
      text: String::new(),
      voice_style: String::new(),
      lang: String::new(),
      provider: String::new(),
      version: String::new(),
      schema_version: String::new(),
      mime_type: None,
      created_at,
      payload,
    }
  }

  /// Size accounted against the byte budget.
  pub fn size_bytes(&self) -> u64 {
    self.payload.len() as u64
  }

  /// Everything but the payload.
  pub fn meta(&self) -> RecordMeta {
    RecordMeta {
      key: self.key.clone(),
      text: self.text.clone(),
      voice_style: self.voice_style.clone(),
      lang: self.lang.clone(),
      provider: self.provider.clone(),
      version: self.version.clone(),
      schema_version: self.schema_version.clone(),
      mime_type: self.mime_type.clone(),
      created_at: self.created_at,
      size_bytes: self.size_bytes(),
    }
  }
}

/// Record metadata returned alongside payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
  pub key: String,
  pub text: String,
  pub voice_style: String,
  pub lang: String,
  pub provider: String,
  pub version: String,
  pub schema_version: String,
  pub mime_type: Option<String>,
  pub created_at: i64,
  pub size_bytes: u64,
}

/// Count and byte total of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub count: u64,
  pub total_bytes: u64,
}

/// Trait for cache storage backends.
///
/// Implementations keep `total_bytes <= max_bytes` after every `put` by
/// evicting the oldest records (by `created_at`, then insertion order).
pub trait CacheStore: Send + Sync {
  /// Prepare the backend (schema, directories). Idempotent.
  fn init(&self) -> Result<(), StorageError>;

  fn get(&self, key: &str) -> Result<Option<CacheRecord>, StorageError>;

  /// Insert or replace a record, then enforce the byte budget.
  fn put(&self, record: CacheRecord) -> Result<(), StorageError>;

  /// Returns whether a record was removed.
  fn delete(&self, key: &str) -> Result<bool, StorageError>;

  /// Keys matching a `*` glob, or every key, oldest first.
  fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError>;

  fn stats(&self) -> Result<CacheStats, StorageError>;

  fn clear_all(&self) -> Result<(), StorageError>;

  /// Remove records created strictly before `before_ts`. Returns how many.
  fn clear_expired(&self, before_ts: i64) -> Result<usize, StorageError>;
}

/// Match a key against a pattern where `*` stands for any run of characters.
pub fn glob_match(pattern: &str, key: &str) -> bool {
  let p: Vec<char> = pattern.chars().collect();
  let k: Vec<char> = key.chars().collect();

  let (mut pi, mut ki) = (0, 0);
  let mut star: Option<usize> = None;
  let mut mark = 0;

  while ki < k.len() {
    if pi < p.len() && p[pi] == '*' {
      star = Some(pi);
      mark = ki;
      pi += 1;
    } else if pi < p.len() && p[pi] == k[ki] {
      pi += 1;
      ki += 1;
    } else if let Some(s) = star {
      pi = s + 1;
      mark += 1;
      ki = mark;
    } else {
      return false;
    }
  }

  p[pi..].iter().all(|c| *c == '*')
}

/// Translate a `*` pattern into an SQLite `GLOB` pattern, quoting the other
/// GLOB metacharacters so they match literally.
pub fn glob_to_sql(pattern: &str) -> String {
  let mut out = String::with_capacity(pattern.len());
  for c in pattern.chars() {
    match c {
      '?' | '[' => {
        out.push('[');
        out.push(c);
        out.push(']');
      }
      _ => out.push(c),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_glob_prefix() {
    assert!(glob_match("user:*", "user:1"));
    assert!(glob_match("user:*", "user:"));
    assert!(!glob_match("user:*", "users:1"));
  }

  #[test]
  fn test_glob_infix_and_literal() {
    assert!(glob_match("a*c", "abbbc"));
    assert!(!glob_match("a*c", "abbbd"));
    assert!(glob_match("exact", "exact"));
    assert!(!glob_match("exact", "exactly"));
    assert!(glob_match("*", ""));
  }

  #[test]
  fn test_glob_to_sql_quotes_metacharacters() {
    assert_eq!(glob_to_sql("user:*"), "user:*");
    assert_eq!(glob_to_sql("what?[x]*"), "what[?][[]x]*");
  }

  #[test]
  fn test_record_meta_reports_size() {
    let record = CacheRecord::bare("k", vec![1, 2, 3], 10);
    let meta = record.meta();
    assert_eq!(meta.size_bytes, 3);
    assert_eq!(meta.created_at, 10);
    assert_eq!(meta.key, "k");
  }
}
