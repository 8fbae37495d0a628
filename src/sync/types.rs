use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Metadata;
use crate::error::{SyncError, SyncErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
  Create,
  Update,
  Delete,
}

impl fmt::Display for OperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Create => f.write_str("create"),
      Self::Update => f.write_str("update"),
      Self::Delete => f.write_str("delete"),
    }
  }
}

/// Lifecycle of an operation. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  Pending,
  Completed,
  Failed,
}

/// How concurrent edits of the same key are resolved on the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
  #[default]
  ClientWins,
}

/// Operation as submitted by a caller, before the queue assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub op_type: OperationType,
  pub key: String,
  pub data: Option<Value>,
  pub metadata: Metadata,
}

impl NewOperation {
  pub fn create(key: impl Into<String>, data: Value) -> Self {
    Self::with_data(OperationType::Create, key, data)
  }

  pub fn update(key: impl Into<String>, data: Value) -> Self {
    Self::with_data(OperationType::Update, key, data)
  }

  pub fn delete(key: impl Into<String>) -> Self {
    Self {
      op_type: OperationType::Delete,
      key: key.into(),
      data: None,
      metadata: Metadata::new(),
    }
  }

  fn with_data(op_type: OperationType, key: impl Into<String>, data: Value) -> Self {
    Self {
      op_type,
      key: key.into(),
      data: Some(data),
      metadata: Metadata::new(),
    }
  }

  pub fn with_metadata(mut self, metadata: Metadata) -> Self {
    self.metadata = metadata;
    self
  }
}

/// A queued change waiting to reach the remote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
  pub id: String,
  #[serde(rename = "type")]
  pub op_type: OperationType,
  pub key: String,
  pub data: Option<Value>,
  pub metadata: Metadata,
  /// Milliseconds since the epoch, set when queued.
  pub timestamp: i64,
  /// Queue insertion order; breaks timestamp ties.
  pub sequence: u64,
  pub retries: u32,
  pub status: OperationStatus,
  pub last_error: Option<String>,
  pub last_error_kind: Option<SyncErrorKind>,
}

impl SyncOperation {
  pub(crate) fn record_failure(&mut self, error: &SyncError) {
    self.retries += 1;
    self.last_error = Some(error.to_string());
    self.last_error_kind = Some(error.kind);
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
  pub total: usize,
  pub pending: usize,
  pub completed: usize,
  pub failed: usize,
  /// Operations completed since startup, including purged ones.
  pub completed_total: u64,
  pub scheduled_retries: usize,
  pub is_syncing: bool,
}

/// Counts for one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
  pub attempted: usize,
  pub completed: usize,
  pub rescheduled: usize,
  pub failed: usize,
  pub purged: usize,
}

/// Result of [`super::SyncManager::sync_now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum FlushReport {
  Flushed(FlushSummary),
  Offline,
  AlreadyRunning,
}
