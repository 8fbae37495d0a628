//! Delayed retries, ordered by due time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

/// Min-heap of due instants with at most one live entry per operation.
///
/// Rescheduling or cancelling leaves the old heap entry in place; it is
/// skipped when it surfaces because it no longer matches `due`.
#[derive(Debug, Default)]
pub struct RetryScheduler {
  heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
  due: HashMap<String, (Instant, u64)>,
  next_seq: u64,
}

impl RetryScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Schedule `id` at `at`, replacing any earlier schedule for it.
  pub fn schedule(&mut self, id: &str, at: Instant) {
    self.next_seq += 1;
    self.due.insert(id.to_string(), (at, self.next_seq));
    self.heap.push(Reverse((at, self.next_seq, id.to_string())));
  }

  pub fn cancel(&mut self, id: &str) -> bool {
    self.due.remove(id).is_some()
  }

  pub fn len(&self) -> usize {
    self.due.len()
  }

  pub fn is_empty(&self) -> bool {
    self.due.is_empty()
  }

  pub fn clear(&mut self) {
    self.heap.clear();
    self.due.clear();
  }

  /// Earliest live due instant.
  pub fn next_due(&mut self) -> Option<Instant> {
    self.drop_stale();
    self.heap.peek().map(|Reverse((at, _, _))| *at)
  }

  /// Remove and return every id due at or before `now`, earliest first.
  pub fn pop_due(&mut self, now: Instant) -> Vec<String> {
    let mut ready = Vec::new();
    loop {
      self.drop_stale();
      match self.heap.peek() {
        Some(Reverse((at, _, _))) if *at <= now => {}
        _ => break,
      }
      if let Some(Reverse((_, _, id))) = self.heap.pop() {
        self.due.remove(&id);
        ready.push(id);
      }
    }
    ready
  }

  fn drop_stale(&mut self) {
    while let Some(Reverse((at, seq, id))) = self.heap.peek() {
      if self.due.get(id) == Some(&(*at, *seq)) {
        break;
      }
      self.heap.pop();
    }
  }
}
