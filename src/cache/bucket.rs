//! Handle to one named bucket.

use color_eyre::Result;
use std::sync::Arc;

use super::traits::{CacheStorage, CachedEntry};
use crate::request::{AssetResponse, RequestKey};

/// A named bucket over a shared storage backend.
///
/// Cheap to clone; clones refer to the same bucket.
#[derive(Clone)]
pub struct Bucket {
  name: String,
  storage: Arc<dyn CacheStorage>,
}

impl Bucket {
  pub fn new(name: impl Into<String>, storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      name: name.into(),
      storage,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn exists(&self) -> Result<bool> {
    self.storage.has_bucket(&self.name)
  }

  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.storage.get(&self.name, key)
  }

  pub fn put(&self, key: &RequestKey, response: &AssetResponse) -> Result<()> {
    self.storage.put(&self.name, key, response)
  }

  pub fn put_all(&self, entries: &[(RequestKey, AssetResponse)]) -> Result<()> {
    self.storage.put_all(&self.name, entries)
  }
}

impl std::fmt::Debug for Bucket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Bucket")
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}
