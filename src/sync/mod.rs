//! Offline-tolerant propagation of local writes.

mod manager;
mod scheduler;
mod types;

pub use manager::{acknowledge_all, SyncConfig, SyncHandler, SyncManager};
pub use scheduler::RetryScheduler;
pub use types::{
  ConflictStrategy, FlushReport, FlushSummary, NewOperation, OperationStatus, OperationType, SyncOperation,
  SyncStats,
};
