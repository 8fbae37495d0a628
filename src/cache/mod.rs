//! Byte-budgeted caching with offline support.
//!
//! This module provides:
//! - Stable content-addressed keys for generation requests
//! - A storage contract with an in-memory and a SQLite backend
//! - A fallback store that degrades from SQLite to memory once per session
//! - A two-tier cache manager with read policies

mod fallback;
mod key;
mod manager;
mod memory;
mod storage;
mod traits;

pub use fallback::{BackendKind, FallbackStore, StoreOptions};
pub use key::{normalize, KeyDeriver, KeyParams, DEFAULT_PROVIDER, DEFAULT_VERSION};
pub use manager::{
  CachePolicy, CacheManager, CachedValue, ManagerStats, MemoryStats, Metadata, SetOptions, Source,
};
pub(crate) use manager::deadline_after;
pub use memory::MemoryStorage;
pub use storage::{SqliteStorage, Table};
pub use traits::{glob_match, CacheRecord, CacheStats, CacheStore, RecordMeta};
