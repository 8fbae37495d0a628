//! Operation queue propagated to the remote when the network allows.
//!
//! A worker task flushes on a fixed interval and on every `online`
//! transition, and runs delayed retries as they fall due. Flushes are
//! single-flight and an operation is never attempted twice at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::RetryScheduler;
use crate::cache::deadline_after;
use super::types::{
  ConflictStrategy, FlushReport, FlushSummary, NewOperation, OperationStatus, SyncOperation, SyncStats,
};
use crate::error::SyncError;
use crate::network::{ListenerId, NetworkEvent, NetworkMonitor};
use crate::observability::Observability;

/// Pushes one operation to the remote.
pub type SyncHandler = Arc<dyn Fn(SyncOperation) -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

/// Handler that acknowledges every operation without contacting anything.
pub fn acknowledge_all() -> SyncHandler {
  Arc::new(|op: SyncOperation| {
    Box::pin(async move {
      debug!(id = %op.id, op_type = %op.op_type, key = %op.key, "operation acknowledged");
      Ok(())
    })
  })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
  pub interval: Duration,
  pub max_retries: u32,
  /// Base delay; the n-th retry waits `retry_delay * n`.
  pub retry_delay: Duration,
  pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      max_retries: 3,
      retry_delay: Duration::from_secs(1),
      conflict_strategy: ConflictStrategy::ClientWins,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
  Completed,
  Rescheduled,
  Failed,
}

#[derive(Debug)]
enum Wake {
  Flush,
  Rescheduled,
}

#[derive(Default)]
struct Queue {
  ops: HashMap<String, SyncOperation>,
  in_flight: HashSet<String>,
  next_seq: u64,
  completed_total: u64,
}

struct Inner {
  config: SyncConfig,
  handler: SyncHandler,
  network: Arc<NetworkMonitor>,
  observability: Arc<Observability>,
  queue: Mutex<Queue>,
  retries: Mutex<RetryScheduler>,
  syncing: AtomicBool,
  wake_tx: mpsc::UnboundedSender<Wake>,
  wake_rx: Mutex<Option<mpsc::UnboundedReceiver<Wake>>>,
  worker: Mutex<Option<JoinHandle<()>>>,
  listener: Mutex<Option<ListenerId>>,
}

/// Clears the single-flight flag when a flush ends or is dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct SyncManager {
  inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn operation_id() -> String {
  let random = Uuid::new_v4().simple().to_string();
  format!("sync_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

impl SyncManager {
  pub fn new(
    config: SyncConfig,
    handler: SyncHandler,
    network: Arc<NetworkMonitor>,
    observability: Arc<Observability>,
  ) -> Self {
    let (wake_tx, wake_rx) = mpsc::unbounded_channel();
    Self {
      inner: Arc::new(Inner {
        config,
        handler,
        network,
        observability,
        queue: Mutex::new(Queue::default()),
        retries: Mutex::new(RetryScheduler::new()),
        syncing: AtomicBool::new(false),
        wake_tx,
        wake_rx: Mutex::new(Some(wake_rx)),
        worker: Mutex::new(None),
        listener: Mutex::new(None),
      }),
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.inner.config
  }

  /// Add an operation to the queue and, when online, attempt it right away.
  /// Returns the assigned id.
  pub async fn queue_operation(&self, op: NewOperation) -> String {
    let id = operation_id();
    {
      let mut queue = lock(&self.inner.queue);
      queue.next_seq += 1;
      let sequence = queue.next_seq;
      queue.ops.insert(
        id.clone(),
        SyncOperation {
          id: id.clone(),
          op_type: op.op_type,
          key: op.key,
          data: op.data,
          metadata: op.metadata,
          timestamp: Utc::now().timestamp_millis(),
          sequence,
          retries: 0,
          status: OperationStatus::Pending,
          last_error: None,
          last_error_kind: None,
        },
      );
    }
    debug!(%id, "operation queued");

    if self.inner.network.is_online() {
      self.attempt(&id).await;
    }
    id
  }

  /// Run one attempt. `None` when the operation is gone, not pending, or
  /// already being attempted.
  async fn attempt(&self, id: &str) -> Option<Attempt> {
    let op = {
      let mut queue = lock(&self.inner.queue);
      let op = queue.ops.get(id)?;
      if op.status != OperationStatus::Pending || queue.in_flight.contains(id) {
        return None;
      }
      let op = op.clone();
      queue.in_flight.insert(id.to_string());
      op
    };
    lock(&self.inner.retries).cancel(id);

    let result = (self.inner.handler)(op).await;

    let mut guard = lock(&self.inner.queue);
    let queue = &mut *guard;
    queue.in_flight.remove(id);
    // Cleared while the handler ran.
    let op = queue.ops.get_mut(id)?;

    let outcome = match result {
      Ok(()) => {
        op.status = OperationStatus::Completed;
        queue.completed_total += 1;
        debug!(%id, "operation synced");
        Attempt::Completed
      }
      Err(e) => {
        op.record_failure(&e);
        self.inner.observability.record_error(&e.kind.to_string(), &e.message);

        if op.retries < self.inner.config.max_retries {
          let delay = self.inner.config.retry_delay.saturating_mul(op.retries);
          lock(&self.inner.retries).schedule(id, deadline_after(delay));
          let _ = self.inner.wake_tx.send(Wake::Rescheduled);
          warn!(%id, retries = op.retries, delay_ms = delay.as_millis() as u64, error = %e, "sync failed, retry scheduled");
          Attempt::Rescheduled
        } else {
          op.status = OperationStatus::Failed;
          error!(%id, retries = op.retries, error = %e, "sync failed permanently");
          Attempt::Failed
        }
      }
    };
    Some(outcome)
  }

  /// Flush every pending operation unless offline or a flush is running.
  pub async fn sync_now(&self) -> FlushReport {
    if !self.inner.network.is_online() {
      return FlushReport::Offline;
    }
    if self.inner.syncing.swap(true, Ordering::SeqCst) {
      return FlushReport::AlreadyRunning;
    }
    let _guard = FlushGuard(&self.inner.syncing);

    let mut pending: Vec<(i64, u64, String)> = lock(&self.inner.queue)
      .ops
      .values()
      .filter(|op| op.status == OperationStatus::Pending)
      .map(|op| (op.timestamp, op.sequence, op.id.clone()))
      .collect();
    pending.sort();

    let mut summary = FlushSummary::default();
    for (_, _, id) in pending {
      let Some(outcome) = self.attempt(&id).await else {
        continue;
      };
      summary.attempted += 1;
      match outcome {
        Attempt::Completed => summary.completed += 1,
        Attempt::Rescheduled => summary.rescheduled += 1,
        Attempt::Failed => summary.failed += 1,
      }
    }

    summary.purged = self.purge_completed();
    if summary.attempted > 0 {
      info!(
        attempted = summary.attempted,
        completed = summary.completed,
        rescheduled = summary.rescheduled,
        failed = summary.failed,
        "sync flush finished"
      );
    }
    FlushReport::Flushed(summary)
  }

  fn purge_completed(&self) -> usize {
    let mut queue = lock(&self.inner.queue);
    let before = queue.ops.len();
    queue.ops.retain(|_, op| op.status != OperationStatus::Completed);
    before - queue.ops.len()
  }

  async fn run_due_retries(&self) {
    let due = lock(&self.inner.retries).pop_due(Instant::now());
    if !self.inner.network.is_online() {
      // Picked up again by the flush on the next online transition.
      debug!(count = due.len(), "offline, skipping due retries");
      return;
    }
    for id in due {
      self.attempt(&id).await;
    }
    self.purge_completed();
  }

  /// Start the background worker and subscribe to `online` transitions.
  pub fn start(&self) {
    let Some(mut wake_rx) = lock(&self.inner.wake_rx).take() else {
      return;
    };

    let tx = self.inner.wake_tx.clone();
    let listener = self.inner.network.on(NetworkEvent::Online, move || {
      let _ = tx.send(Wake::Flush);
    });
    *lock(&self.inner.listener) = Some(listener);

    let manager = self.clone();
    let period = self.inner.config.interval;
    let task = tokio::spawn(async move {
      let mut ticker = interval_at(deadline_after(period), period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        let next_retry = lock(&manager.inner.retries).next_due();
        tokio::select! {
          _ = ticker.tick() => {
            manager.sync_now().await;
          }
          wake = wake_rx.recv() => match wake {
            Some(Wake::Flush) => {
              manager.sync_now().await;
            }
            Some(Wake::Rescheduled) => {}
            None => break,
          },
          _ = wait_until(next_retry) => {
            manager.run_due_retries().await;
          }
        }
      }
    });
    *lock(&self.inner.worker) = Some(task);

    info!(
      interval_ms = period.as_millis() as u64,
      max_retries = self.inner.config.max_retries,
      conflict_strategy = ?self.inner.config.conflict_strategy,
      "sync manager started"
    );
  }

  /// Stop the worker and unsubscribe. Queued operations are kept.
  pub fn shutdown(&self) {
    if let Some(id) = lock(&self.inner.listener).take() {
      self.inner.network.off(NetworkEvent::Online, id);
    }
    if let Some(task) = lock(&self.inner.worker).take() {
      task.abort();
      info!("sync manager stopped");
    }
  }

  pub fn get_stats(&self) -> SyncStats {
    let queue = lock(&self.inner.queue);
    let count = |status| queue.ops.values().filter(|op| op.status == status).count();
    SyncStats {
      total: queue.ops.len(),
      pending: count(OperationStatus::Pending),
      completed: count(OperationStatus::Completed),
      failed: count(OperationStatus::Failed),
      completed_total: queue.completed_total,
      scheduled_retries: lock(&self.inner.retries).len(),
      is_syncing: self.inner.syncing.load(Ordering::SeqCst),
    }
  }

  /// Snapshot of the queue, oldest first.
  pub fn operations(&self) -> Vec<SyncOperation> {
    let mut ops: Vec<SyncOperation> = lock(&self.inner.queue).ops.values().cloned().collect();
    ops.sort_by_key(|op| (op.timestamp, op.sequence));
    ops
  }

  pub fn clear_queue(&self) {
    {
      let mut queue = lock(&self.inner.queue);
      queue.ops.clear();
      queue.in_flight.clear();
    }
    lock(&self.inner.retries).clear();
    info!("sync queue cleared");
  }
}

async fn wait_until(at: Option<Instant>) {
  match at {
    Some(at) => sleep_until(at).await,
    None => std::future::pending().await,
  }
}
