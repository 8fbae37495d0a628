//! Text-to-speech audio caching.

mod coalescer;
mod generator;
mod service;

pub use coalescer::{Coalesced, RequestCoalescer};
pub use generator::{Generated, HttpGenerator};
pub use service::{AudioSource, TtsCache, TtsResult};
