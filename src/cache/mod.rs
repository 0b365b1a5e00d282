//! Offline asset cache.
//!
//! This module provides the bucket-based caching mechanism that:
//! - Stores whole responses keyed by request identity (method + URL)
//! - Keeps one named bucket per deployed version
//! - Serves GET requests network-first or cache-first with background refresh
//! - Degrades to plain networking when storage is unavailable

mod background;
mod bucket;
mod layer;
mod storage;
mod traits;

pub use background::BackgroundWrites;
pub use bucket::Bucket;
pub use layer::{CacheLayer, Strategy};
pub use storage::{NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CacheStorage, CachedEntry};
