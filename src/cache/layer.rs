//! Cache layer that orchestrates bucket lookups with network fetching.

use color_eyre::{Report, Result};
use serde::Deserialize;
use std::sync::Arc;

use super::background::BackgroundWrites;
use super::bucket::Bucket;
use super::traits::{CacheResult, CacheSource, CachedEntry};
use crate::net::Fetcher;
use crate::request::{AssetRequest, AssetResponse, RequestKey};

/// How intercepted GET requests are served.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Try the network, fall back to the bucket when offline
  #[default]
  NetworkFirst,
  /// Serve from the bucket, refresh the entry in the background
  CacheFirstRefresh,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::CacheFirstRefresh => write!(f, "cache-first-refresh"),
    }
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the app and the network, providing transparent
/// caching with offline support. Writes never block the response.
#[derive(Clone)]
pub struct CacheLayer {
  bucket: Bucket,
  fetcher: Arc<dyn Fetcher>,
  strategy: Strategy,
  /// Served for failed navigations with no exact match
  root_document: RequestKey,
  writes: BackgroundWrites,
}

impl CacheLayer {
  pub fn new(
    bucket: Bucket,
    fetcher: Arc<dyn Fetcher>,
    strategy: Strategy,
    root_document: RequestKey,
  ) -> Self {
    Self {
      bucket,
      fetcher,
      strategy,
      root_document,
      writes: BackgroundWrites::new(),
    }
  }

  pub fn strategy(&self) -> Strategy {
    self.strategy
  }

  pub fn writes(&self) -> &BackgroundWrites {
    &self.writes
  }

  /// Serve one intercepted request.
  pub async fn serve(&self, request: AssetRequest) -> Result<CacheResult> {
    if !request.is_get() {
      let response = self.fetcher.fetch(request).await?;
      return Ok(CacheResult::passthrough(response));
    }

    match self.bucket.exists() {
      Ok(true) => {}
      Ok(false) => {
        tracing::warn!("Bucket {} is gone, serving {} uncached", self.bucket.name(), request.url);
        return self.passthrough(request).await;
      }
      Err(e) => {
        tracing::warn!("Cache unavailable, serving {} uncached: {:#}", request.url, e);
        return self.passthrough(request).await;
      }
    }

    match self.strategy {
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirstRefresh => self.cache_first(request).await,
    }
  }

  /// Network-first.
  ///
  /// 1. Fetch from network - on success return it and store a copy
  /// 2. On network failure, return the cached entry (offline mode)
  /// 3. For navigations with no entry, return the root document
  async fn network_first(&self, request: AssetRequest) -> Result<CacheResult> {
    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        self.store_in_background(&request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        tracing::debug!("Network failed for {}, trying cache: {:#}", request.url, e);
        if let Some(entry) = self.lookup(&request.key()) {
          return Ok(CacheResult::from_cache(entry, CacheSource::Offline));
        }
        self.navigation_fallback(&request, e)
      }
    }
  }

  /// Cache-first with background refresh.
  ///
  /// 1. Check bucket - on hit return immediately, refetch in the background
  /// 2. On miss fetch from network and store a copy
  /// 3. On network failure, navigations get the root document
  async fn cache_first(&self, request: AssetRequest) -> Result<CacheResult> {
    if let Some(entry) = self.lookup(&request.key()) {
      tracing::debug!("Cache hit for {}", request.url);
      self.refresh_in_background(request);
      return Ok(CacheResult::from_cache(entry, CacheSource::Cache));
    }

    tracing::debug!("Cache miss for {}", request.url);
    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        self.store_in_background(&request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => self.navigation_fallback(&request, e),
    }
  }

  async fn passthrough(&self, request: AssetRequest) -> Result<CacheResult> {
    let response = self.fetcher.fetch(request).await?;
    Ok(CacheResult::passthrough(response))
  }

  /// Bucket lookup where a storage error counts as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.bucket.lookup(key) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!("Cache lookup failed for {}: {:#}", key, e);
        None
      }
    }
  }

  fn navigation_fallback(&self, request: &AssetRequest, error: Report) -> Result<CacheResult> {
    if request.is_navigation() {
      if let Some(entry) = self.lookup(&self.root_document) {
        tracing::info!("Offline navigation to {}, serving {}", request.url, self.root_document.url);
        return Ok(CacheResult::from_cache(entry, CacheSource::NavigationFallback));
      }
    }
    Err(error)
  }

  /// Store a copy of a successful response without waiting for it.
  fn store_in_background(&self, request: &AssetRequest, response: &AssetResponse) {
    if !response.is_ok() || !request.is_cacheable_scheme() {
      return;
    }

    let bucket = self.bucket.clone();
    let key = request.key();
    let response = response.clone();
    self
      .writes
      .spawn(format!("store {}", key), async move { bucket.put(&key, &response) });
  }

  /// Refetch and overwrite an entry without blocking the caller.
  ///
  /// Network failures here are expected when offline and only logged.
  fn refresh_in_background(&self, request: AssetRequest) {
    if !request.is_cacheable_scheme() {
      return;
    }

    let bucket = self.bucket.clone();
    let fetcher = Arc::clone(&self.fetcher);
    let key = request.key();
    self.writes.spawn(format!("refresh {}", key), async move {
      match fetcher.fetch(request).await {
        Ok(response) if response.is_ok() => bucket.put(&key, &response),
        Ok(response) => {
          tracing::debug!("Refresh of {} returned {}, keeping cached entry", key, response.status);
          Ok(())
        }
        Err(e) => {
          tracing::debug!("Refresh of {} failed: {:#}", key, e);
          Ok(())
        }
      }
    });
  }
}
