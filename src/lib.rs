//! Offline-tolerant caching and sync for expensive remote generation.
//!
//! Text-to-speech audio is cached by a content-addressed key, concurrent
//! identical requests share one generation, and local writes reach the
//! remote through a retrying queue that waits for connectivity.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod network;
pub mod observability;
pub mod repository;
pub mod sync;
pub mod tts;

pub use context::Context;
pub use error::{Error, Result};
