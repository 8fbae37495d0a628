//! Local-first data access: reads follow a fetch policy, writes land in the
//! cache immediately and reach the remote through the sync queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CachePolicy, CacheManager, CachedValue, ManagerStats, Metadata, SetOptions, Source};
use crate::error::{Error, FetchError, Result};
use crate::network::{NetworkMonitor, NetworkStats};
use crate::sync::{NewOperation, SyncManager, SyncStats};

/// Loads the remote copy of a key.
pub type NetworkFetcher<T> = Box<dyn FnOnce(&str) -> BoxFuture<'static, std::result::Result<T, FetchError>> + Send>;

/// Options for [`Repository::get`].
pub struct GetOptions<T> {
  /// Falls back to the repository default.
  pub policy: Option<CachePolicy>,
  pub fetcher: Option<NetworkFetcher<T>>,
  /// Memory-tier lifetime for fetched values.
  pub ttl: Option<Duration>,
  /// Write fetched values back to the cache.
  pub cache_network_data: bool,
}

impl<T> Default for GetOptions<T> {
  fn default() -> Self {
    Self {
      policy: None,
      fetcher: None,
      ttl: None,
      cache_network_data: true,
    }
  }
}

impl<T: Send + 'static> GetOptions<T> {
  pub fn policy(policy: CachePolicy) -> Self {
    Self {
      policy: Some(policy),
      ..Default::default()
    }
  }

  pub fn with_fetcher<F, Fut>(mut self, fetcher: F) -> Self
  where
    F: FnOnce(String) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
  {
    self.fetcher = Some(Box::new(move |key: &str| -> BoxFuture<'static, _> {
      Box::pin(fetcher(key.to_string()))
    }));
    self
  }
}

/// Options for writes.
#[derive(Debug, Clone)]
pub struct WriteOptions {
  pub ttl: Option<Duration>,
  pub metadata: Metadata,
  /// Queue the change for the remote when online.
  pub sync: bool,
}

impl Default for WriteOptions {
  fn default() -> Self {
    Self {
      ttl: None,
      metadata: Metadata::new(),
      sync: true,
    }
  }
}

impl WriteOptions {
  pub fn local_only() -> Self {
    Self {
      sync: false,
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteSource {
  Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
  pub success: bool,
  pub source: WriteSource,
  /// Id of the queued sync operation, if one was queued.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub operation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryStats {
  pub cache: ManagerStats,
  pub sync: SyncStats,
  pub network: NetworkStats,
}

pub struct Repository {
  cache: Arc<CacheManager>,
  sync: SyncManager,
  network: Arc<NetworkMonitor>,
  default_policy: CachePolicy,
}

impl Repository {
  pub fn new(
    cache: Arc<CacheManager>,
    sync: SyncManager,
    network: Arc<NetworkMonitor>,
    default_policy: CachePolicy,
  ) -> Self {
    Self {
      cache,
      sync,
      network,
      default_policy,
    }
  }

  pub fn default_policy(&self) -> CachePolicy {
    self.default_policy
  }

  /// Read `key` under the requested policy.
  ///
  /// Without a fetcher `network-first` reads the cache and `network-only`
  /// yields `None`.
  pub async fn get<T>(&self, key: &str, options: GetOptions<T>) -> Result<Option<CachedValue<T>>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let policy = options.policy.unwrap_or(self.default_policy);
    let online = self.network.is_online();
    debug!(key, %policy, online, "repository get");

    match policy {
      CachePolicy::CacheOnly => self.cache.get(key, CachePolicy::CacheOnly),

      CachePolicy::CacheFirst => {
        if let Some(hit) = self.cache.get(key, CachePolicy::CacheFirst)? {
          return Ok(Some(hit));
        }
        match options.fetcher {
          Some(fetcher) if online => {
            let value = fetcher(key).await?;
            self.store_fetched(key, value, options.ttl, options.cache_network_data).map(Some)
          }
          _ => Ok(None),
        }
      }

      CachePolicy::NetworkFirst => {
        if let (Some(fetcher), true) = (options.fetcher, online) {
          match fetcher(key).await {
            Ok(value) => {
              return self
                .store_fetched(key, value, options.ttl, options.cache_network_data)
                .map(Some);
            }
            Err(e) => warn!(key, error = %e, "fetch failed, falling back to cache"),
          }
        }
        self.cache.get(key, CachePolicy::NetworkFirst)
      }

      CachePolicy::NetworkOnly => {
        if !online {
          return Err(Error::Offline);
        }
        let Some(fetcher) = options.fetcher else {
          return Ok(None);
        };
        let value = fetcher(key).await?;
        self.store_fetched(key, value, options.ttl, options.cache_network_data).map(Some)
      }
    }
  }

  fn store_fetched<T: Serialize>(
    &self,
    key: &str,
    value: T,
    ttl: Option<Duration>,
    cache: bool,
  ) -> Result<CachedValue<T>> {
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), Value::from("network"));
    metadata.insert("fetchedAt".to_string(), Value::from(Utc::now().timestamp_millis()));

    if cache {
      metadata = self.cache.set(key, &value, SetOptions { ttl, metadata })?;
    }

    Ok(CachedValue {
      value,
      metadata,
      source: Source::Network,
    })
  }

  pub async fn set<T: Serialize>(&self, key: &str, value: &T, options: WriteOptions) -> Result<WriteResult> {
    let (data, metadata) = self.write_local(key, value, &options)?;
    self
      .enqueue(options.sync, || NewOperation::create(key, data).with_metadata(metadata))
      .await
  }

  pub async fn update<T: Serialize>(&self, key: &str, value: &T, options: WriteOptions) -> Result<WriteResult> {
    let (data, metadata) = self.write_local(key, value, &options)?;
    self
      .enqueue(options.sync, || NewOperation::update(key, data).with_metadata(metadata))
      .await
  }

  pub async fn delete(&self, key: &str, options: WriteOptions) -> Result<WriteResult> {
    self.cache.delete(key)?;
    let mut metadata = options.metadata;
    metadata.insert("source".to_string(), Value::from("local"));
    metadata.insert("updatedAt".to_string(), Value::from(Utc::now().timestamp_millis()));
    self
      .enqueue(options.sync, || NewOperation::delete(key).with_metadata(metadata))
      .await
  }

  /// Cache `value` locally. Returns the serialized value and the metadata
  /// that was stored with it.
  fn write_local<T: Serialize>(&self, key: &str, value: &T, options: &WriteOptions) -> Result<(Value, Metadata)> {
    let mut metadata = options.metadata.clone();
    metadata.insert("source".to_string(), Value::from("local"));
    metadata.insert("updatedAt".to_string(), Value::from(Utc::now().timestamp_millis()));

    let metadata = self.cache.set(
      key,
      value,
      SetOptions {
        ttl: options.ttl,
        metadata,
      },
    )?;
    Ok((serde_json::to_value(value)?, metadata))
  }

  async fn enqueue(&self, sync: bool, op: impl FnOnce() -> NewOperation) -> Result<WriteResult> {
    let operation_id = if sync && self.network.is_online() {
      Some(self.sync.queue_operation(op()).await)
    } else {
      None
    };
    Ok(WriteResult {
      success: true,
      source: WriteSource::Local,
      operation_id,
    })
  }

  /// Cached values whose keys match `pattern`. Keys that vanish between
  /// listing and reading are skipped.
  pub fn query<T: DeserializeOwned>(&self, pattern: &str) -> Result<Vec<(String, CachedValue<T>)>> {
    let mut results = Vec::new();
    for key in self.cache.keys(Some(pattern))? {
      if let Some(hit) = self.cache.get(&key, CachePolicy::CacheFirst)? {
        results.push((key, hit));
      }
    }
    Ok(results)
  }

  pub fn get_stats(&self) -> Result<RepositoryStats> {
    Ok(RepositoryStats {
      cache: self.cache.get_stats()?,
      sync: self.sync.get_stats(),
      network: self.network.get_stats(),
    })
  }
}
