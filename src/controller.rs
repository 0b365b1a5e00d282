//! The slot holding whichever worker currently controls the app.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};

use crate::cache::CacheResult;
use crate::net::Fetcher;
use crate::request::AssetRequest;
use crate::worker::{CacheWorker, WorkerState};

/// Routes requests to the active worker.
///
/// Swapping the active worker is a single write under the lock, and every
/// request snapshots the worker before it starts, so one request is always
/// served by exactly one worker generation.
pub struct Controller {
  active: RwLock<Option<Arc<CacheWorker>>>,
  /// Used while no worker is active
  fetcher: Arc<dyn Fetcher>,
}

impl Controller {
  pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      active: RwLock::new(None),
      fetcher,
    }
  }

  /// Version tag of the active worker, if any.
  pub fn active_version(&self) -> Option<String> {
    self.current().map(|w| w.version().to_string())
  }

  pub fn current(&self) -> Option<Arc<CacheWorker>> {
    self.active.read().ok().and_then(|w| w.clone())
  }

  /// Full lifecycle for a new version: install, activate, take control.
  ///
  /// If install fails the previous worker keeps control.
  pub async fn register(&self, worker: Arc<CacheWorker>) -> Result<()> {
    worker.install().await?;
    // Installed workers never wait for the old one to go idle
    worker.activate().await?;
    self.claim(worker)
  }

  /// Take control with a version that is already installed and active.
  pub fn resume(&self, worker: Arc<CacheWorker>) -> Result<()> {
    worker.resume()?;
    self.claim(worker)
  }

  /// Make an activated worker the one that serves all requests.
  pub fn claim(&self, worker: Arc<CacheWorker>) -> Result<()> {
    if worker.state() != WorkerState::Activated {
      return Err(eyre!(
        "Worker {} cannot take control while {}",
        worker.version(),
        worker.state()
      ));
    }

    let previous = {
      let mut active = self
        .active
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      active.replace(Arc::clone(&worker))
    };

    match previous {
      Some(old) if !Arc::ptr_eq(&old, &worker) => {
        old.retire();
        tracing::info!("Worker {} took control from {}", worker.version(), old.version());
      }
      Some(_) => {}
      None => tracing::info!("Worker {} took control", worker.version()),
    }

    Ok(())
  }

  /// Serve a request through the active worker, or the network if none.
  pub async fn handle(&self, request: AssetRequest) -> Result<CacheResult> {
    match self.current() {
      Some(worker) => worker.handle_fetch(request).await,
      None => {
        let response = self.fetcher.fetch(request).await?;
        Ok(CacheResult::passthrough(response))
      }
    }
  }

  /// Wait for the active worker's background writes.
  ///
  /// Returns how many of its writes have failed so far.
  pub async fn settle(&self) -> u64 {
    match self.current() {
      Some(worker) => {
        let writes = worker.writes();
        writes.settle().await;
        tracing::debug!(
          "{} background writes stored, {} failed",
          writes.completed(),
          writes.failures()
        );
        writes.failures()
      }
      None => 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheStorage, SqliteStorage, Strategy};
  use crate::config::InstallPolicy;
  use crate::net::testing::ScriptedFetcher;
  use crate::request::{AssetResponse, RequestKey};
  use crate::worker::WorkerOptions;
  use url::Url;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn worker(
    version: &str,
    storage: &Arc<dyn CacheStorage>,
    fetcher: &Arc<ScriptedFetcher>,
  ) -> Arc<CacheWorker> {
    let options = WorkerOptions {
      version: version.to_string(),
      manifest: vec![
        url("https://a.test/"),
        url("https://a.test/index.html"),
        url("https://a.test/app.js"),
      ],
      root_document: RequestKey::get(&url("https://a.test/index.html")),
      strategy: Strategy::NetworkFirst,
      install_policy: InstallPolicy::Strict,
    };
    Arc::new(CacheWorker::new(options, storage.clone(), fetcher.clone()))
  }

  fn setup() -> (Arc<dyn CacheStorage>, Arc<ScriptedFetcher>) {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.route("https://a.test/", AssetResponse::new(200, "root"));
    fetcher.route("https://a.test/index.html", AssetResponse::new(200, "<html>"));
    fetcher.route("https://a.test/app.js", AssetResponse::new(200, "app"));
    (storage, fetcher)
  }

  #[tokio::test]
  async fn test_upgrade_from_v1_to_v2() {
    let (storage, fetcher) = setup();
    let controller = Controller::new(fetcher.clone());

    let v1 = worker("v1", &storage, &fetcher);
    controller.register(v1.clone()).await.unwrap();
    assert_eq!(controller.active_version().as_deref(), Some("v1"));

    let v2 = worker("v2", &storage, &fetcher);
    v2.install().await.unwrap();
    // Installing alone never touches the old bucket
    assert!(storage.has_bucket("v1").unwrap());

    v2.activate().await.unwrap();
    controller.claim(v2.clone()).unwrap();

    assert!(!storage.has_bucket("v1").unwrap());
    assert_eq!(storage.bucket_names().unwrap(), vec!["v2".to_string()]);
    assert_eq!(storage.entries("v2").unwrap().len(), 3);
    assert_eq!(v1.state(), WorkerState::Redundant);
    assert_eq!(controller.active_version().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_failed_register_keeps_previous_worker() {
    let (storage, fetcher) = setup();
    let controller = Controller::new(fetcher.clone());
    controller
      .register(worker("v1", &storage, &fetcher))
      .await
      .unwrap();

    fetcher.set_offline(true);
    assert!(controller
      .register(worker("v2", &storage, &fetcher))
      .await
      .is_err());
    assert_eq!(controller.active_version().as_deref(), Some("v1"));

    // Still offline: v1 serves from its bucket
    let result = controller
      .handle(AssetRequest::get(url("https://a.test/app.js")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.body, b"app");
  }

  #[tokio::test]
  async fn test_no_active_worker_passes_through() {
    let (_storage, fetcher) = setup();
    let controller = Controller::new(fetcher.clone());

    let result = controller
      .handle(AssetRequest::get(url("https://a.test/app.js")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::PassThrough);

    fetcher.set_offline(true);
    assert!(controller
      .handle(AssetRequest::navigate(url("https://a.test/")))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_evicted_version_cannot_take_control() {
    let (storage, fetcher) = setup();
    let controller = Controller::new(fetcher.clone());
    let v1 = worker("v1", &storage, &fetcher);
    let v2 = worker("v2", &storage, &fetcher);
    let (a, b) = tokio::join!(v1.install(), v2.install());
    a.unwrap();
    b.unwrap();

    v1.activate().await.unwrap();
    controller.claim(v1.clone()).unwrap();

    assert!(v2.activate().await.is_err());
    assert!(controller.claim(v2.clone()).is_err());
    assert_eq!(controller.active_version().as_deref(), Some("v1"));
    assert_eq!(storage.bucket_names().unwrap(), vec!["v1".to_string()]);
  }

  #[tokio::test]
  async fn test_claim_requires_activation() {
    let (storage, fetcher) = setup();
    let controller = Controller::new(fetcher.clone());
    let v1 = worker("v1", &storage, &fetcher);
    v1.install().await.unwrap();

    assert!(controller.claim(v1.clone()).is_err());
    assert!(controller.active_version().is_none());
  }

  #[tokio::test]
  async fn test_resume_after_restart() {
    let (storage, fetcher) = setup();
    Controller::new(fetcher.clone())
      .register(worker("v1", &storage, &fetcher))
      .await
      .unwrap();

    // A fresh process picks the installed version back up
    let controller = Controller::new(fetcher.clone());
    controller.resume(worker("v1", &storage, &fetcher)).unwrap();

    fetcher.set_offline(true);
    let result = controller
      .handle(AssetRequest::navigate(url("https://a.test/itinerary")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::NavigationFallback);
    assert_eq!(result.response.body, b"<html>");
  }

  #[tokio::test]
  async fn test_settle_waits_for_active_worker_writes() {
    let (storage, fetcher) = setup();
    let controller = Controller::new(fetcher.clone());
    controller
      .register(worker("v1", &storage, &fetcher))
      .await
      .unwrap();

    fetcher.route("https://a.test/app.js", AssetResponse::new(200, "app v2"));
    controller
      .handle(AssetRequest::get(url("https://a.test/app.js")))
      .await
      .unwrap();
    assert_eq!(controller.settle().await, 0);

    let entry = storage
      .get("v1", &RequestKey::get(&url("https://a.test/app.js")))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.body, b"app v2");
  }
}
