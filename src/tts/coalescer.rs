//! Single-flight execution: at most one in-flight job per key.
//!
//! The first caller for a key becomes the leader and runs the job. Callers
//! arriving while it runs subscribe to a one-shot signal and receive a clone
//! of the leader's outcome instead of running the job again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{Error, GeneratorError};

type Outcome<T> = Result<T, Error>;
type Signal<T> = watch::Receiver<Option<Outcome<T>>>;

enum Role<T> {
  Leader(watch::Sender<Option<Outcome<T>>>),
  Follower(Signal<T>),
}

/// Outcome of [`RequestCoalescer::run`].
#[derive(Debug)]
pub struct Coalesced<T> {
  pub outcome: Outcome<T>,
  /// The caller joined an in-flight job instead of running its own.
  pub merged: bool,
}

/// Map from key to the signal of its in-flight job.
pub struct RequestCoalescer<T> {
  pending: Mutex<HashMap<String, Signal<T>>>,
}

impl<T> Default for RequestCoalescer<T> {
  fn default() -> Self {
    Self {
      pending: Mutex::new(HashMap::new()),
    }
  }
}

/// Removes the leader's entry however the job ends, including when the
/// leader's future is dropped mid-flight.
struct PendingGuard<'a, T> {
  coalescer: &'a RequestCoalescer<T>,
  key: &'a str,
}

impl<T> Drop for PendingGuard<'_, T> {
  fn drop(&mut self) {
    self.coalescer.lock().remove(self.key);
  }
}

impl<T> RequestCoalescer<T> {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Signal<T>>> {
    self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Number of keys with a job in flight.
  pub fn in_flight(&self) -> usize {
    self.lock().len()
  }

  pub fn is_pending(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }
}

impl<T: Clone> RequestCoalescer<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `job` for `key`, or join the job already running for it.
  pub async fn run<F, Fut>(&self, key: &str, job: F) -> Coalesced<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Outcome<T>>,
  {
    let role = {
      let mut pending = self.lock();
      match pending.get(key) {
        Some(signal) => Role::Follower(signal.clone()),
        None => {
          let (tx, rx) = watch::channel(None);
          pending.insert(key.to_string(), rx);
          Role::Leader(tx)
        }
      }
    };

    match role {
      Role::Follower(mut signal) => {
        let outcome = match signal.wait_for(Option::is_some).await {
          Ok(value) => value
            .clone()
            .unwrap_or_else(|| Err(GeneratorError::Abandoned.into())),
          // Leader dropped without publishing.
          Err(_) => Err(GeneratorError::Abandoned.into()),
        };
        Coalesced {
          outcome,
          merged: true,
        }
      }
      Role::Leader(tx) => {
        let guard = PendingGuard {
          coalescer: self,
          key,
        };
        let outcome = job().await;
        // Publish before unregistering so every subscriber sees the result.
        tx.send_replace(Some(outcome.clone()));
        drop(guard);
        Coalesced {
          outcome,
          merged: false,
        }
      }
    }
  }
}
