//! Error types for the cache and sync engine.
//!
//! Every failure carries its kind from the point where it happened, so callers
//! and the observability recorder never need to inspect message text.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Failure of the persistent (SQLite) backend.
///
/// These never reach callers of [`crate::cache::FallbackStore`]; the store
/// degrades to memory instead.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("could not open cache database at {path}: {source}")]
  Open {
    path: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("could not create cache directory {path}: {source}")]
  Directory {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("cache database query failed: {0}")]
  Query(#[from] rusqlite::Error),

  #[error("cache database lock poisoned")]
  LockPoisoned,

  #[error("could not determine a data directory for the cache")]
  NoDataDir,
}

/// Failure of a connectivity probe.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
  #[error("probe timed out after {0} ms")]
  Timeout(u64),

  #[error("probe request failed: {0}")]
  Request(String),
}

/// Failure of the remote generator. Cloned to every caller waiting on the key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
  #[error("generator failed: {0}")]
  Failed(String),

  #[error("generator returned an empty payload")]
  EmptyPayload,

  #[error("generation for this key was abandoned before it finished")]
  Abandoned,
}

impl GeneratorError {
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed(message.into())
  }
}

/// Failure of a caller-supplied network fetcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("network fetch failed: {0}")]
pub struct FetchError(pub String);

impl FetchError {
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

/// Classification of a failed sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncErrorKind {
  Auth,
  Quota,
  Timeout,
  Network,
  Unknown,
}

impl fmt::Display for SyncErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Auth => "auth",
      Self::Quota => "quota",
      Self::Timeout => "timeout",
      Self::Network => "network",
      Self::Unknown => "unknown",
    };
    f.write_str(name)
  }
}

/// Failure reported by a [`crate::sync::SyncHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct SyncError {
  pub kind: SyncErrorKind,
  pub message: String,
}

impl SyncError {
  pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

/// Crate-level error returned by the public cache, repository and TTS APIs.
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// A network-only read was requested while offline.
  #[error("network is offline and the network-only policy was requested")]
  Offline,

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("serialization failed: {0}")]
  Serialization(String),

  #[error("storage failed: {0}")]
  Storage(String),

  #[error(transparent)]
  Generator(#[from] GeneratorError),

  #[error(transparent)]
  Fetch(#[from] FetchError),
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<StorageError> for Error {
  fn from(e: StorageError) -> Self {
    Self::Storage(e.to_string())
  }
}

/// Convenience Result type for the engine.
pub type Result<T> = std::result::Result<T, Error>;
