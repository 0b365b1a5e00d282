//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::request::{AssetResponse, RequestKey};

/// A response stored in a bucket.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Request identity the response is stored under
  pub key: RequestKey,
  /// The stored response
  pub response: AssetResponse,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
  /// Hex SHA-256 of the body
  pub digest: String,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named buckets. Every single-entry write is
/// atomic; `put_all` writes a batch in one transaction.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open_bucket(&self, bucket: &str) -> Result<()>;

  /// Whether a bucket with this name exists.
  fn has_bucket(&self, bucket: &str) -> Result<bool>;

  /// Names of all existing buckets.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all its entries. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// Look up a stored response.
  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Store a response, replacing any previous entry for the same key.
  fn put(&self, bucket: &str, key: &RequestKey, response: &AssetResponse) -> Result<()>;

  /// Store several responses in one transaction.
  fn put_all(&self, bucket: &str, entries: &[(RequestKey, AssetResponse)]) -> Result<()>;

  /// All entries in a bucket, ordered by URL.
  fn entries(&self, bucket: &str) -> Result<Vec<CachedEntry>>;
}

/// Result from serving a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The response handed back to the caller
  pub response: AssetResponse,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  /// A response fresh from the network.
  pub fn from_network(response: AssetResponse) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// A response that bypassed the cache entirely.
  pub fn passthrough(response: AssetResponse) -> Self {
    Self {
      response,
      source: CacheSource::PassThrough,
      cached_at: None,
    }
  }

  /// A stored response served from the bucket.
  pub fn from_cache(entry: CachedEntry, source: CacheSource) -> Self {
    Self {
      response: entry.response,
      source,
      cached_at: Some(entry.cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Not eligible for caching (non-GET, or no active bucket)
  PassThrough,
  /// Cache hit served before the network (cache-first)
  Cache,
  /// Network unavailable, serving the cached entry
  Offline,
  /// Network unavailable, serving the root document for a navigation
  NavigationFallback,
}
