//! Audio cache: derives the key, coalesces concurrent requests and consults
//! the store before calling the generator.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::coalescer::RequestCoalescer;
use super::generator::Generated;
use crate::cache::{normalize, CacheRecord, CacheStats, CacheStore, KeyDeriver, KeyParams, RecordMeta};
use crate::error::{Error, GeneratorError, Result};
use crate::observability::Observability;

/// Where the audio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
  Cache,
  Network,
}

/// Result of [`TtsCache::get_or_generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct TtsResult {
  pub key: String,
  pub payload: Vec<u8>,
  pub source: AudioSource,
  pub meta: RecordMeta,
  /// Only filled for fresh generations.
  pub hints: BTreeMap<String, String>,
  /// The caller joined a generation started by another caller.
  pub merged: bool,
}

/// Keeps the concurrent-request gauge balanced even if the caller is dropped.
struct InFlight<'a>(&'a Observability);

impl<'a> InFlight<'a> {
  fn enter(obs: &'a Observability) -> Self {
    obs.record_concurrent_start();
    Self(obs)
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.record_concurrent_end();
  }
}

pub struct TtsCache {
  deriver: KeyDeriver,
  store: Arc<dyn CacheStore>,
  coalescer: RequestCoalescer<TtsResult>,
  observability: Arc<Observability>,
}

impl TtsCache {
  pub fn new(deriver: KeyDeriver, store: Arc<dyn CacheStore>, observability: Arc<Observability>) -> Self {
    Self {
      deriver,
      store,
      coalescer: RequestCoalescer::new(),
      observability,
    }
  }

  pub fn deriver(&self) -> &KeyDeriver {
    &self.deriver
  }

  /// Return cached audio for `params`, or run `generator` and cache its output.
  ///
  /// Concurrent calls for the same key share one generator run. Generator
  /// errors reach every waiting caller and leave nothing in the store.
  pub async fn get_or_generate<F, Fut>(&self, params: &KeyParams, generator: F) -> Result<TtsResult>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Generated, GeneratorError>>,
  {
    if normalize(&params.text).is_empty() {
      return Err(Error::InvalidRequest("text must not be empty".to_string()));
    }

    let key = self.deriver.build_key(params);
    let _in_flight = InFlight::enter(&self.observability);

    let result = self
      .coalescer
      .run(&key, || self.load_or_generate(&key, params, generator))
      .await;

    if result.merged {
      self.observability.record_request_merged(&key);
    }

    match result.outcome {
      Ok(mut found) => {
        found.merged = result.merged;
        Ok(found)
      }
      Err(e) => {
        if !result.merged {
          self.observability.record_error("generator", &e.to_string());
        }
        Err(e)
      }
    }
  }

  async fn load_or_generate<F, Fut>(&self, key: &str, params: &KeyParams, generator: F) -> Result<TtsResult>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Generated, GeneratorError>>,
  {
    let started = Instant::now();

    if let Some(record) = self.lookup(key) {
      self.observability.record_cache_hit(key, started.elapsed());
      return Ok(TtsResult {
        key: key.to_string(),
        meta: record.meta(),
        payload: record.payload,
        source: AudioSource::Cache,
        hints: BTreeMap::new(),
        merged: false,
      });
    }

    let generated = generator().await?;
    if generated.payload.is_empty() {
      return Err(GeneratorError::EmptyPayload.into());
    }
    self.observability.record_cache_miss(key, started.elapsed());

    let record = CacheRecord {
      key: key.to_string(),
      text: params.text.clone(),
      voice_style: params.voice_style.clone(),
      lang: params.lang.clone(),
      provider: params.provider().to_string(),
      version: params.version().to_string(),
      schema_version: self.deriver.schema_version().to_string(),
      mime_type: generated.mime_type,
      created_at: Utc::now().timestamp_millis(),
      payload: generated.payload,
    };
    let meta = record.meta();

    // A failed write still returns the fresh audio.
    let payload = record.payload.clone();
    if let Err(e) = self.store.put(record) {
      warn!(key, error = %e, "could not cache generated audio");
      self.observability.record_error("storage", &e.to_string());
    }

    Ok(TtsResult {
      key: key.to_string(),
      payload,
      source: AudioSource::Network,
      meta,
      hints: generated.metadata_hints,
      merged: false,
    })
  }

  /// Fetch a usable record, dropping it if it was written under another schema.
  fn lookup(&self, key: &str) -> Option<CacheRecord> {
    let record = match self.store.get(key) {
      Ok(record) => record?,
      Err(e) => {
        warn!(key, error = %e, "cache lookup failed, treating as miss");
        self.observability.record_error("storage", &e.to_string());
        return None;
      }
    };

    if record.schema_version != self.deriver.schema_version() {
      debug!(
        key,
        stored = %record.schema_version,
        current = %self.deriver.schema_version(),
        "dropping record from another schema version"
      );
      if let Err(e) = self.store.delete(key) {
        warn!(key, error = %e, "could not drop stale record");
      }
      return None;
    }

    Some(record)
  }

  pub fn clear_all(&self) -> Result<()> {
    self.store.clear_all()?;
    info!("audio cache cleared");
    Ok(())
  }

  /// Remove records created before `before_ms`. Returns how many were removed.
  pub fn clear_expired(&self, before_ms: i64) -> Result<usize> {
    let removed = self.store.clear_expired(before_ms)?;
    info!(removed, before_ms, "expired audio removed");
    Ok(removed)
  }

  pub fn stats(&self) -> Result<CacheStats> {
    Ok(self.store.stats()?)
  }
}
