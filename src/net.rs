//! Network access behind a small trait so the cache can be driven offline.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::Duration;

use crate::request::{AssetRequest, AssetResponse};

/// Something that can perform a request against the network.
///
/// `Err` means the network itself failed (offline, DNS, timeout, reset).
/// Any HTTP status, including 404 or 500, is an `Ok` response.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: AssetRequest) -> BoxFuture<'static, Result<AssetResponse>>;
}

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("roma-cache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: AssetRequest) -> BoxFuture<'static, Result<AssetResponse>> {
    let client = self.client.clone();
    Box::pin(async move {
      let url = request.url.to_string();
      let response = client
        .request(request.method, request.url)
        .send()
        .await
        .map_err(|e| eyre!("network error fetching {}: {}", url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("network error reading body of {}: {}", url, e))?;

      Ok(AssetResponse {
        status,
        headers,
        body: body.to_vec(),
      })
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted fetcher for unit tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// In-memory network: URL -> response, with an offline switch.
  #[derive(Default)]
  pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, AssetResponse>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
  }

  impl ScriptedFetcher {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn route(&self, url: &str, response: AssetResponse) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
      self.seen.lock().unwrap().clone()
    }
  }

  impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: AssetRequest) -> BoxFuture<'static, Result<AssetResponse>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let url = request.url.to_string();
      self
        .seen
        .lock()
        .unwrap()
        .push(format!("{} {}", request.method, url));

      let result = if self.offline.load(Ordering::SeqCst) {
        Err(eyre!("network error fetching {}: offline", url))
      } else {
        match self.routes.lock().unwrap().get(&url) {
          Some(response) => Ok(response.clone()),
          None => Err(eyre!("network error fetching {}: connection refused", url)),
        }
      };

      Box::pin(async move { result })
    }
  }
}
