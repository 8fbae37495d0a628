//! Online/offline state shared by the whole engine.
//!
//! State changes come from three places: the startup hint, connectivity
//! events pushed by the host, and a periodic active probe. The most recent
//! input wins, and listeners hear only actual transitions.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::header::CACHE_CONTROL;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::NetworkError;

/// Connectivity event a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkEvent {
  Online,
  Offline,
}

impl fmt::Display for NetworkEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Online => f.write_str("online"),
      Self::Offline => f.write_str("offline"),
    }
  }
}

/// Handle returned by [`NetworkMonitor::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Active reachability check. `Ok(true)` means online.
pub type Probe = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, NetworkError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerCounts {
  pub online: usize,
  pub offline: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
  pub is_online: bool,
  pub last_check: Option<DateTime<Utc>>,
  pub listeners: ListenerCounts,
}

/// Probe that sends an uncached `HEAD` request to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: &str) -> Result<Self, NetworkError> {
    let url = Url::parse(url).map_err(|e| NetworkError::Request(format!("invalid probe url '{url}': {e}")))?;
    Ok(Self {
      client: reqwest::Client::new(),
      url,
    })
  }

  pub async fn check(&self) -> Result<bool, NetworkError> {
    let response = self
      .client
      .head(self.url.clone())
      .header(CACHE_CONTROL, "no-cache")
      .send()
      .await
      .map_err(|e| NetworkError::Request(e.to_string()))?;
    Ok(response.status().is_success())
  }

  pub fn into_probe(self) -> Probe {
    let probe = Arc::new(self);
    Arc::new(move || {
      let probe = probe.clone();
      Box::pin(async move { probe.check().await })
    })
  }
}

#[derive(Default)]
struct Listeners {
  next_id: u64,
  online: BTreeMap<ListenerId, Listener>,
  offline: BTreeMap<ListenerId, Listener>,
}

impl Listeners {
  fn for_event(&mut self, event: NetworkEvent) -> &mut BTreeMap<ListenerId, Listener> {
    match event {
      NetworkEvent::Online => &mut self.online,
      NetworkEvent::Offline => &mut self.offline,
    }
  }
}

/// Single source of truth for connectivity.
pub struct NetworkMonitor {
  online: AtomicBool,
  /// Milliseconds since the epoch of the last state update, 0 when never.
  last_check: AtomicU64,
  listeners: Mutex<Listeners>,
  probe: Option<Probe>,
  check_interval: Duration,
  timeout: Duration,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
  pub fn new(initial_online: bool) -> Self {
    Self {
      online: AtomicBool::new(initial_online),
      last_check: AtomicU64::new(0),
      listeners: Mutex::new(Listeners::default()),
      probe: None,
      check_interval: Duration::from_secs(5),
      timeout: Duration::from_secs(3),
      task: Mutex::new(None),
    }
  }

  pub fn with_probe(mut self, probe: Probe, check_interval: Duration, timeout: Duration) -> Self {
    self.probe = Some(probe);
    self.check_interval = check_interval;
    self.timeout = timeout;
    self
  }

  fn listeners(&self) -> MutexGuard<'_, Listeners> {
    self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Subscribe to `event`. The callback runs on the task that caused the
  /// transition and must not block.
  pub fn on(&self, event: NetworkEvent, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
    let mut listeners = self.listeners();
    listeners.next_id += 1;
    let id = ListenerId(listeners.next_id);
    listeners.for_event(event).insert(id, Arc::new(listener));
    id
  }

  /// Unsubscribe. Returns whether the listener was registered.
  pub fn off(&self, event: NetworkEvent, id: ListenerId) -> bool {
    self.listeners().for_event(event).remove(&id).is_some()
  }

  /// The only place the online flag changes. Fires listeners on transition.
  pub fn update_online_status(&self, online: bool) {
    self
      .last_check
      .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::SeqCst);

    let was_online = self.online.swap(online, Ordering::SeqCst);
    if was_online == online {
      return;
    }

    let event = if online {
      NetworkEvent::Online
    } else {
      NetworkEvent::Offline
    };
    info!(%event, "network status changed");
    self.emit(event);
  }

  /// Connectivity event pushed by the host environment.
  pub fn handle_connectivity_change(&self, online: bool) {
    debug!(online, "connectivity change reported");
    self.update_online_status(online);
  }

  fn emit(&self, event: NetworkEvent) {
    // Snapshot so listeners may subscribe or unsubscribe while running.
    let listeners: Vec<(ListenerId, Listener)> = self
      .listeners()
      .for_event(event)
      .iter()
      .map(|(id, l)| (*id, l.clone()))
      .collect();

    for (id, listener) in listeners {
      if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
        error!(%event, listener = id.0, "network listener panicked");
      }
    }
  }

  /// Probe now and update the state. Without a probe, report the current state.
  pub async fn check_network_status(&self) -> bool {
    let Some(probe) = self.probe.clone() else {
      return self.is_online();
    };

    let online = match tokio::time::timeout(self.timeout, probe()).await {
      Ok(Ok(reachable)) => reachable,
      Ok(Err(e)) => {
        debug!(error = %e, "network probe failed");
        false
      }
      Err(_) => {
        let e = NetworkError::Timeout(self.timeout.as_millis() as u64);
        debug!(error = %e, "network probe failed");
        false
      }
    };

    self.update_online_status(online);
    online
  }

  /// Spawn the periodic probe. No-op without a probe or when already running.
  pub fn start(self: &Arc<Self>) {
    if self.probe.is_none() {
      return;
    }
    let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if task.is_some() {
      return;
    }

    let monitor = Arc::downgrade(self);
    let period = self.check_interval;
    *task = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(monitor) = monitor.upgrade() else {
          break;
        };
        monitor.check_network_status().await;
      }
    }));
    info!(interval_ms = period.as_millis() as u64, "network monitor started");
  }

  /// Stop the periodic probe. Listeners stay registered.
  pub fn shutdown(&self) {
    let task = self
      .task
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(task) = task {
      task.abort();
      info!("network monitor stopped");
    }
  }

  pub fn get_stats(&self) -> NetworkStats {
    let last_check = match self.last_check.load(Ordering::SeqCst) {
      0 => None,
      ms => DateTime::from_timestamp_millis(ms as i64),
    };
    let listeners = self.listeners();
    NetworkStats {
      is_online: self.is_online(),
      last_check,
      listeners: ListenerCounts {
        online: listeners.online.len(),
        offline: listeners.offline.len(),
      },
    }
  }
}

impl Drop for NetworkMonitor {
  fn drop(&mut self) {
    if let Ok(mut task) = self.task.lock() {
      if let Some(task) = task.take() {
        warn!("network monitor dropped without shutdown");
        task.abort();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn counter(monitor: &NetworkMonitor, event: NetworkEvent) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    monitor.on(event, move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    count
  }

  fn fixed_probe(result: Result<bool, NetworkError>) -> Probe {
    Arc::new(move || {
      let result = result.clone();
      Box::pin(async move { result })
    })
  }

  #[test]
  fn test_fires_once_per_transition() {
    let monitor = NetworkMonitor::new(false);
    let online = counter(&monitor, NetworkEvent::Online);
    let offline = counter(&monitor, NetworkEvent::Offline);

    monitor.update_online_status(true);
    monitor.update_online_status(true);
    assert_eq!(online.load(Ordering::SeqCst), 1);
    assert_eq!(offline.load(Ordering::SeqCst), 0);

    monitor.handle_connectivity_change(false);
    assert!(!monitor.is_online());
    assert_eq!(offline.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_panicking_listener_does_not_stop_others() {
    let monitor = NetworkMonitor::new(false);
    monitor.on(NetworkEvent::Online, || panic!("listener bug"));
    let online = counter(&monitor, NetworkEvent::Online);

    monitor.update_online_status(true);
    assert_eq!(online.load(Ordering::SeqCst), 1);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_off_unsubscribes() {
    let monitor = NetworkMonitor::new(true);
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let id = monitor.on(NetworkEvent::Offline, move || {
      c.fetch_add(1, Ordering::SeqCst);
    });

    assert!(monitor.off(NetworkEvent::Offline, id));
    assert!(!monitor.off(NetworkEvent::Offline, id));
    monitor.update_online_status(false);
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_stats() {
    let monitor = NetworkMonitor::new(true);
    assert_eq!(monitor.get_stats().last_check, None);
    counter(&monitor, NetworkEvent::Online);
    monitor.update_online_status(true);

    let stats = monitor.get_stats();
    assert!(stats.is_online);
    assert!(stats.last_check.is_some());
    assert_eq!(stats.listeners, ListenerCounts { online: 1, offline: 0 });
  }

  #[tokio::test]
  async fn test_check_without_probe_reports_current_state() {
    let monitor = NetworkMonitor::new(false);
    assert!(!monitor.check_network_status().await);
  }

  #[tokio::test]
  async fn test_failed_probe_means_offline() {
    let monitor = NetworkMonitor::new(true).with_probe(
      fixed_probe(Err(NetworkError::Request("connection refused".into()))),
      Duration::from_secs(5),
      Duration::from_secs(1),
    );
    let offline = counter(&monitor, NetworkEvent::Offline);

    assert!(!monitor.check_network_status().await);
    assert_eq!(offline.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_probe_times_out() {
    let probe: Probe = Arc::new(|| {
      Box::pin(async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(true)
      })
    });
    let monitor = NetworkMonitor::new(true).with_probe(probe, Duration::from_secs(5), Duration::from_secs(3));
    assert!(!monitor.check_network_status().await);
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_probe_updates_state() {
    let monitor = Arc::new(NetworkMonitor::new(false).with_probe(
      fixed_probe(Ok(true)),
      Duration::from_secs(5),
      Duration::from_secs(1),
    ));
    let online = counter(&monitor, NetworkEvent::Online);

    monitor.start();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(monitor.is_online());
    assert_eq!(online.load(Ordering::SeqCst), 1);

    monitor.shutdown();
  }
}
