//! The application handle: one instance of every component, built once at
//! startup and passed to whoever needs it.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::info;

use crate::cache::{BackendKind, CacheManager, CacheStore, FallbackStore, KeyDeriver, StoreOptions, Table};
use crate::config::Config;
use crate::network::{HttpProbe, NetworkMonitor};
use crate::observability::Observability;
use crate::repository::Repository;
use crate::sync::{acknowledge_all, SyncHandler, SyncManager};
use crate::tts::TtsCache;

pub struct Context {
  pub config: Config,
  pub observability: Arc<Observability>,
  pub network: Arc<NetworkMonitor>,
  pub audio_store: Arc<FallbackStore>,
  pub entry_store: Arc<FallbackStore>,
  pub tts: TtsCache,
  pub cache: Arc<CacheManager>,
  pub sync: SyncManager,
  pub repository: Repository,
}

impl Context {
  /// Build every component with the acknowledging sync handler.
  pub fn from_config(config: Config) -> Result<Self> {
    Self::with_sync_handler(config, acknowledge_all())
  }

  pub fn with_sync_handler(config: Config, handler: SyncHandler) -> Result<Self> {
    let observability = Arc::new(Observability::new(config.observability.enabled));

    let mut network = NetworkMonitor::new(config.network.initial_online);
    if let Some(url) = &config.network.probe_url {
      let probe = HttpProbe::new(url).map_err(|e| eyre!("Invalid network probe: {}", e))?;
      network = network.with_probe(
        probe.into_probe(),
        Duration::from_millis(config.network.check_interval_ms),
        Duration::from_millis(config.network.timeout_ms),
      );
    }
    let network = Arc::new(network);

    let store_options = |table| StoreOptions {
      path: config.cache.db_path.clone(),
      table,
      max_bytes: config.cache.max_bytes,
      force_memory: config.cache.force_memory,
    };
    let audio_store = Arc::new(FallbackStore::open(&store_options(Table::Audio)));
    let entry_store = Arc::new(FallbackStore::open(&store_options(Table::Entries)));

    let deriver = KeyDeriver::new(&config.cache.schema_version, &config.cache.environment);
    let tts = TtsCache::new(
      deriver,
      audio_store.clone() as Arc<dyn CacheStore>,
      observability.clone(),
    );

    let cache = Arc::new(CacheManager::new(
      entry_store.clone() as Arc<dyn CacheStore>,
      config.memory.default_ttl(),
    ));
    let sync = SyncManager::new(
      config.sync.to_sync_config(),
      handler,
      network.clone(),
      observability.clone(),
    );
    let repository = Repository::new(
      cache.clone(),
      sync.clone(),
      network.clone(),
      config.repository.default_policy,
    );

    info!(
      audio_backend = %audio_store.backend(),
      entry_backend = %entry_store.backend(),
      online = network.is_online(),
      "context ready"
    );

    Ok(Self {
      config,
      observability,
      network,
      audio_store,
      entry_store,
      tts,
      cache,
      sync,
      repository,
    })
  }

  /// Whether both stores are still persistent.
  pub fn is_persistent(&self) -> bool {
    self.audio_store.backend() == BackendKind::Persistent && self.entry_store.backend() == BackendKind::Persistent
  }

  /// Start the background probe, memory sweep and sync worker. Needs a
  /// tokio runtime.
  pub fn start(&self) {
    self.network.start();
    self.cache.start_pruning(self.config.memory.prune_interval());
    self.sync.start();
  }

  pub fn shutdown(&self) {
    self.sync.shutdown();
    self.cache.stop_pruning();
    self.network.shutdown();
  }
}
