//! Lifecycle of one deployed version of the offline cache.
//!
//! A worker moves through `Parsed -> Installing -> Installed -> Activating ->
//! Activated`. A failed install or a newer worker taking over makes it
//! `Redundant`. Only activated workers serve requests from their bucket.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{
  BackgroundWrites, Bucket, CacheLayer, CacheResult, CacheStorage, Strategy,
};
use crate::config::{Config, InstallPolicy};
use crate::net::Fetcher;
use crate::request::{AssetRequest, AssetResponse, RequestKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting; always skips straight to activation when asked
  Installed,
  Activating,
  Activated,
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Everything a worker needs besides its storage and network.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub version: String,
  pub manifest: Vec<Url>,
  pub root_document: RequestKey,
  pub strategy: Strategy,
  pub install_policy: InstallPolicy,
}

impl WorkerOptions {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      version: config.version.clone(),
      manifest: config.manifest_urls()?,
      root_document: config.root_document_key()?,
      strategy: config.strategy,
      install_policy: config.install_policy,
    })
  }
}

/// Outcome of a completed install.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
  /// Manifest URLs now in the bucket
  pub cached: Vec<String>,
  /// Manifest URLs that could not be fetched, with the reason
  pub failed: Vec<(String, String)>,
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
  /// Stale buckets that were deleted
  pub evicted: Vec<String>,
  /// Stale buckets that could not be deleted
  pub failed: Vec<String>,
}

/// One version of the offline cache and its bucket.
pub struct CacheWorker {
  version: String,
  manifest: Vec<Url>,
  install_policy: InstallPolicy,
  bucket: Bucket,
  fetcher: Arc<dyn Fetcher>,
  layer: CacheLayer,
  state: Mutex<WorkerState>,
}

impl CacheWorker {
  pub fn new(
    options: WorkerOptions,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Self {
    let bucket = Bucket::new(options.version.clone(), storage);
    let layer = CacheLayer::new(
      bucket.clone(),
      Arc::clone(&fetcher),
      options.strategy,
      options.root_document,
    );

    Self {
      version: options.version,
      manifest: options.manifest,
      install_policy: options.install_policy,
      bucket,
      fetcher,
      layer,
      state: Mutex::new(WorkerState::Parsed),
    }
  }

  pub fn from_config(
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    Ok(Self::new(WorkerOptions::from_config(config)?, storage, fetcher))
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn strategy(&self) -> Strategy {
    self.layer.strategy()
  }

  /// Pending and failed background cache writes.
  pub fn writes(&self) -> &BackgroundWrites {
    self.layer.writes()
  }

  pub fn state(&self) -> WorkerState {
    self.state.lock().map(|s| *s).unwrap_or(WorkerState::Redundant)
  }

  fn set_state(&self, next: WorkerState) {
    if let Ok(mut state) = self.state.lock() {
      tracing::debug!("Worker {}: {} -> {}", self.version, *state, next);
      *state = next;
    }
  }

  /// Move `from -> to` atomically, failing if the worker is elsewhere.
  fn transition(&self, from: &[WorkerState], to: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if !from.contains(&*state) {
      return Err(eyre!(
        "Worker {} cannot become {} while {}",
        self.version,
        to,
        *state
      ));
    }

    tracing::debug!("Worker {}: {} -> {}", self.version, *state, to);
    *state = to;
    Ok(())
  }

  /// Populate this version's bucket with the manifest.
  ///
  /// All assets are fetched concurrently and written in one transaction.
  /// Under the strict policy a single failure aborts the install and
  /// nothing is written; the worker becomes redundant.
  pub async fn install(&self) -> Result<InstallReport> {
    self.transition(&[WorkerState::Parsed], WorkerState::Installing)?;
    tracing::info!(
      "Installing {} ({} assets, {:?} policy)",
      self.version,
      self.manifest.len(),
      self.install_policy
    );

    let fetches = self.manifest.iter().map(|url| {
      let fetcher = Arc::clone(&self.fetcher);
      let request = AssetRequest::get(url.clone());
      async move {
        let key = request.key();
        (key, fetcher.fetch(request).await)
      }
    });
    let results = futures::future::join_all(fetches).await;

    let mut report = InstallReport::default();
    let mut fetched: Vec<(RequestKey, AssetResponse)> = Vec::with_capacity(results.len());
    for (key, result) in results {
      match result {
        Ok(response) if response.is_ok() => {
          report.cached.push(key.url.clone());
          fetched.push((key, response));
        }
        Ok(response) => {
          report
            .failed
            .push((key.url, format!("HTTP status {}", response.status)));
        }
        Err(e) => report.failed.push((key.url, format!("{:#}", e))),
      }
    }

    if !report.failed.is_empty() {
      match self.install_policy {
        InstallPolicy::Strict => {
          self.set_state(WorkerState::Redundant);
          let failed: Vec<String> = report
            .failed
            .iter()
            .map(|(url, reason)| format!("{} ({})", url, reason))
            .collect();
          return Err(eyre!(
            "Install of {} aborted, {} of {} assets failed: {}",
            self.version,
            report.failed.len(),
            self.manifest.len(),
            failed.join(", ")
          ));
        }
        InstallPolicy::Lenient => {
          for (url, reason) in &report.failed {
            tracing::warn!("Install of {}: skipping {}: {}", self.version, url, reason);
          }
        }
      }
    }

    if let Err(e) = self.bucket.put_all(&fetched) {
      self.set_state(WorkerState::Redundant);
      return Err(eyre!("Install of {} failed to store assets: {}", self.version, e));
    }

    self.set_state(WorkerState::Installed);
    tracing::info!(
      "Installed {}: {} cached, {} failed",
      self.version,
      report.cached.len(),
      report.failed.len()
    );
    Ok(report)
  }

  /// Take over an install left on disk by an earlier run.
  pub fn adopt(&self) -> Result<()> {
    self.require_bucket()?;
    self.transition(&[WorkerState::Parsed], WorkerState::Installed)
  }

  /// Resume an already active version without evicting anything.
  pub fn resume(&self) -> Result<()> {
    self.require_bucket()?;
    self.transition(&[WorkerState::Parsed], WorkerState::Activated)
  }

  fn require_bucket(&self) -> Result<()> {
    if !self.bucket.exists()? {
      return Err(eyre!(
        "Version {} is not installed (no bucket named {})",
        self.version,
        self.bucket.name()
      ));
    }
    Ok(())
  }

  /// Delete every bucket that does not belong to this version.
  ///
  /// Deletion failures are logged and reported but never block activation.
  /// Activating an already active worker only repeats the eviction.
  ///
  /// The last version to activate wins. If another activation has already
  /// evicted this version's bucket, the worker becomes redundant and the
  /// error leaves the current controller in place.
  pub async fn activate(&self) -> Result<ActivateReport> {
    self.transition(
      &[WorkerState::Installed, WorkerState::Activated],
      WorkerState::Activating,
    )?;
    tracing::info!("Activating {}", self.version);
    self.require_own_bucket()?;

    let mut report = ActivateReport::default();
    let storage = self.bucket.storage();

    let names = match storage.bucket_names() {
      Ok(names) => names,
      Err(e) => {
        tracing::warn!("Activate {}: could not list buckets: {:#}", self.version, e);
        Vec::new()
      }
    };

    for name in names.into_iter().filter(|n| n != &self.version) {
      match storage.delete_bucket(&name) {
        Ok(_) => {
          tracing::info!("Evicted stale bucket {}", name);
          report.evicted.push(name);
        }
        Err(e) => {
          tracing::warn!("Failed to evict stale bucket {}: {:#}", name, e);
          report.failed.push(name);
        }
      }
    }

    // A concurrent activation may have evicted us while we were evicting
    self.require_own_bucket()?;
    self.set_state(WorkerState::Activated);
    Ok(report)
  }

  /// Like `require_bucket`, but a missing bucket also makes the worker redundant.
  fn require_own_bucket(&self) -> Result<()> {
    if let Err(e) = self.require_bucket() {
      self.set_state(WorkerState::Redundant);
      tracing::warn!("Activation of {} abandoned: {:#}", self.version, e);
      return Err(e);
    }
    Ok(())
  }

  /// Called when a newer worker takes control.
  pub(crate) fn retire(&self) {
    self.set_state(WorkerState::Redundant);
  }

  /// Serve an intercepted request.
  ///
  /// Until activation the worker does not intercept anything and the request
  /// goes straight to the network.
  pub async fn handle_fetch(&self, request: AssetRequest) -> Result<CacheResult> {
    if self.state() != WorkerState::Activated {
      let response = self.fetcher.fetch(request).await?;
      return Ok(CacheResult::passthrough(response));
    }
    self.layer.serve(request).await
  }
}

impl fmt::Debug for CacheWorker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheWorker")
      .field("version", &self.version)
      .field("state", &self.state())
      .field("strategy", &self.strategy())
      .finish_non_exhaustive()
  }
}
