//! Request and response types seen by the offline cache.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// How the browsing context issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Full-page navigation (eligible for the root document fallback)
  Navigate,
  /// Any other request (scripts, stylesheets, images, API calls)
  #[default]
  Subresource,
}

/// A single outgoing request intercepted from the app.
#[derive(Debug, Clone)]
pub struct AssetRequest {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl AssetRequest {
  /// A plain GET subresource request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url: strip_fragment(url),
      mode: RequestMode::Subresource,
    }
  }

  /// A GET request for a full-page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// Any request with an explicit method.
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      ..Self::get(url)
    }
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Only http(s) responses are ever written to a bucket.
  pub fn is_cacheable_scheme(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  /// Identity of this request inside a bucket.
  pub fn key(&self) -> RequestKey {
    RequestKey {
      method: self.method.as_str().to_string(),
      url: self.url.to_string(),
    }
  }
}

/// Request identity: method + absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  /// Identity of a GET for the given URL.
  pub fn get(url: &Url) -> Self {
    Self {
      method: Method::GET.as_str().to_string(),
      url: strip_fragment(url.clone()).to_string(),
    }
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A fully buffered response, as fetched or as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl AssetResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Only exact 200 responses are stored.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Resolve a manifest entry against the install scope.
///
/// Absolute URLs pass through; relative paths such as `./index.html` are
/// joined onto the scope.
pub fn resolve(scope: &Url, entry: &str) -> Result<Url> {
  scope
    .join(entry)
    .map(strip_fragment)
    .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", entry, scope, e))
}

fn strip_fragment(mut url: Url) -> Url {
  url.set_fragment(None);
  url
}
