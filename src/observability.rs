//! Best-effort counters for the TTS cache.
//!
//! Recording never fails and never blocks for long; when the recorder is
//! disabled every call is a no-op.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

/// How many recent latencies are kept for the average.
pub const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct Metrics {
  cache_hits: u64,
  cache_misses: u64,
  network_requests: u64,
  concurrent_requests: u64,
  merged_requests: u64,
  total_requests: u64,
  errors: BTreeMap<String, u64>,
  latencies: VecDeque<u64>,
}

impl Metrics {
  fn record_latency(&mut self, latency: Duration) {
    self.latencies.push_back(latency.as_millis() as u64);
    while self.latencies.len() > LATENCY_WINDOW {
      self.latencies.pop_front();
    }
  }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilitySnapshot {
  pub uptime_secs: u64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub network_requests: u64,
  pub concurrent_requests: u64,
  pub merged_requests: u64,
  pub total_requests: u64,
  pub errors_by_kind: BTreeMap<String, u64>,
  /// hits / (hits + misses), 0 when nothing was recorded.
  pub hit_rate: f64,
  /// Mean of the recent latency window, in milliseconds.
  pub avg_latency_ms: u64,
  pub recent_latencies: usize,
}

/// Hit/miss/merge/error/latency recorder.
#[derive(Debug)]
pub struct Observability {
  enabled: AtomicBool,
  started: Mutex<Instant>,
  metrics: Mutex<Metrics>,
}

impl Default for Observability {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Observability {
  pub fn new(enabled: bool) -> Self {
    Self {
      enabled: AtomicBool::new(enabled),
      started: Mutex::new(Instant::now()),
      metrics: Mutex::new(Metrics::default()),
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::Relaxed)
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.store(enabled, Ordering::Relaxed);
    debug!(enabled, "observability toggled");
  }

  /// Apply `f` to the counters if enabled and the lock is healthy.
  fn with(&self, f: impl FnOnce(&mut Metrics)) {
    if !self.is_enabled() {
      return;
    }
    if let Ok(mut metrics) = self.metrics.lock() {
      f(&mut metrics);
    }
  }

  pub fn record_cache_hit(&self, key: &str, latency: Duration) {
    self.with(|m| {
      m.cache_hits += 1;
      m.total_requests += 1;
      m.record_latency(latency);
    });
    debug!(key = short(key), latency_ms = latency.as_millis() as u64, "cache hit");
  }

  /// A miss implies one request to the generator.
  pub fn record_cache_miss(&self, key: &str, latency: Duration) {
    self.with(|m| {
      m.cache_misses += 1;
      m.total_requests += 1;
      m.network_requests += 1;
      m.record_latency(latency);
    });
    debug!(key = short(key), latency_ms = latency.as_millis() as u64, "cache miss");
  }

  pub fn record_request_merged(&self, key: &str) {
    self.with(|m| m.merged_requests += 1);
    debug!(key = short(key), "request merged into in-flight generation");
  }

  pub fn record_concurrent_start(&self) {
    self.with(|m| m.concurrent_requests += 1);
  }

  pub fn record_concurrent_end(&self) {
    self.with(|m| m.concurrent_requests = m.concurrent_requests.saturating_sub(1));
  }

  pub fn record_error(&self, kind: &str, message: &str) {
    if !self.is_enabled() {
      return;
    }
    self.with(|m| *m.errors.entry(kind.to_string()).or_insert(0) += 1);
    warn!(kind, message, "error recorded");
  }

  pub fn hit_rate(&self) -> f64 {
    self.snapshot().hit_rate
  }

  pub fn snapshot(&self) -> ObservabilitySnapshot {
    let uptime_secs = self
      .started
      .lock()
      .map(|s| s.elapsed().as_secs())
      .unwrap_or(0);

    let Ok(m) = self.metrics.lock() else {
      return ObservabilitySnapshot::empty(uptime_secs);
    };

    let lookups = m.cache_hits + m.cache_misses;
    let hit_rate = if lookups == 0 {
      0.0
    } else {
      m.cache_hits as f64 / lookups as f64
    };
    let avg_latency_ms = if m.latencies.is_empty() {
      0
    } else {
      m.latencies.iter().sum::<u64>() / m.latencies.len() as u64
    };

    ObservabilitySnapshot {
      uptime_secs,
      cache_hits: m.cache_hits,
      cache_misses: m.cache_misses,
      network_requests: m.network_requests,
      concurrent_requests: m.concurrent_requests,
      merged_requests: m.merged_requests,
      total_requests: m.total_requests,
      errors_by_kind: m.errors.clone(),
      hit_rate,
      avg_latency_ms,
      recent_latencies: m.latencies.len(),
    }
  }

  /// Zero every counter and restart the uptime clock.
  pub fn reset(&self) {
    if let Ok(mut m) = self.metrics.lock() {
      *m = Metrics::default();
    }
    if let Ok(mut started) = self.started.lock() {
      *started = Instant::now();
    }
  }
}

impl ObservabilitySnapshot {
  fn empty(uptime_secs: u64) -> Self {
    Self {
      uptime_secs,
      cache_hits: 0,
      cache_misses: 0,
      network_requests: 0,
      concurrent_requests: 0,
      merged_requests: 0,
      total_requests: 0,
      errors_by_kind: BTreeMap::new(),
      hit_rate: 0.0,
      avg_latency_ms: 0,
      recent_latencies: 0,
    }
  }
}

fn short(key: &str) -> &str {
  key.get(..16).unwrap_or(key)
}
