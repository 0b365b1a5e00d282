use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Strategy;
use crate::request::{self, RequestKey};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Version tag; doubles as the name of the current cache bucket
  pub version: String,
  /// Install location that relative manifest entries resolve against
  pub scope: Url,
  /// Assets that must be cached before the app works offline
  #[serde(default)]
  pub manifest: Vec<String>,
  /// Manifest entry served for offline navigations with no exact match
  #[serde(default = "default_root_document")]
  pub root_document: String,
  #[serde(default)]
  pub strategy: Strategy,
  #[serde(default)]
  pub install_policy: InstallPolicy,
  #[serde(default = "default_fetch_timeout_secs")]
  pub fetch_timeout_secs: u64,
  /// SQLite database path (defaults to $XDG_DATA_HOME/roma-cache/cache.db)
  pub storage_path: Option<PathBuf>,
}

fn default_root_document() -> String {
  "./index.html".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallPolicy {
  /// Any manifest failure aborts the install and nothing is stored
  #[default]
  Strict,
  /// Failures are logged, successful assets are stored
  Lenient,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./roma-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/roma-cache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/roma-cache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("roma-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("roma-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::parse(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parse and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }

    let manifest = self.manifest_urls()?;
    let root = self.root_document_url()?;
    if !manifest.contains(&root) {
      return Err(eyre!(
        "root_document {} is not listed in the manifest",
        self.root_document
      ));
    }

    Ok(())
  }

  /// Manifest entries resolved against the scope, in order, duplicates removed.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    let mut urls: Vec<Url> = Vec::with_capacity(self.manifest.len());
    for entry in &self.manifest {
      let url = request::resolve(&self.scope, entry)?;
      if !urls.contains(&url) {
        urls.push(url);
      }
    }
    Ok(urls)
  }

  pub fn root_document_url(&self) -> Result<Url> {
    request::resolve(&self.scope, &self.root_document)
  }

  /// Identity under which the root document is stored.
  pub fn root_document_key(&self) -> Result<RequestKey> {
    Ok(RequestKey::get(&self.root_document_url()?))
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }
}

/// Directory for the cache database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("roma-cache"))
}

#[cfg(test)]
mod tests {
  use super::*;

  const EXAMPLE: &str = r#"
version: roma-explorer-v8
scope: https://example.github.io/roma/
manifest:
  - ./
  - ./index.html
  - ./manifest.json
  - https://unpkg.com/leaflet@1.9.4/dist/leaflet.css
"#;

  #[test]
  fn test_defaults() {
    let config = Config::parse(EXAMPLE).unwrap();
    assert_eq!(config.version, "roma-explorer-v8");
    assert_eq!(config.strategy, Strategy::NetworkFirst);
    assert_eq!(config.install_policy, InstallPolicy::Strict);
    assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
    assert_eq!(config.root_document, "./index.html");
    assert!(config.storage_path.is_none());
  }

  #[test]
  fn test_manifest_resolution() {
    let config = Config::parse(EXAMPLE).unwrap();
    let urls: Vec<String> = config
      .manifest_urls()
      .unwrap()
      .into_iter()
      .map(String::from)
      .collect();
    assert_eq!(
      urls,
      vec![
        "https://example.github.io/roma/",
        "https://example.github.io/roma/index.html",
        "https://example.github.io/roma/manifest.json",
        "https://unpkg.com/leaflet@1.9.4/dist/leaflet.css",
      ]
    );
    assert_eq!(
      config.root_document_key().unwrap().url,
      "https://example.github.io/roma/index.html"
    );
  }

  #[test]
  fn test_duplicate_manifest_entries_collapse() {
    let yaml = r#"
version: v1
scope: https://a.test/
manifest: ["./index.html", "/index.html", "index.html"]
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.manifest_urls().unwrap().len(), 1);
  }

  #[test]
  fn test_strategy_and_policy_parse() {
    let yaml = r#"
version: v2
scope: https://a.test/
manifest: ["./index.html"]
strategy: cache-first-refresh
install_policy: lenient
fetch_timeout_secs: 5
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.strategy, Strategy::CacheFirstRefresh);
    assert_eq!(config.install_policy, InstallPolicy::Lenient);
    assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
  }

  #[test]
  fn test_root_document_must_be_in_manifest() {
    let yaml = r#"
version: v1
scope: https://a.test/
manifest: ["./app.js"]
"#;
    let err = Config::parse(yaml).unwrap_err();
    assert!(err.to_string().contains("root_document"));
  }

  #[test]
  fn test_example_config_is_valid() {
    let config = Config::parse(include_str!("../config.example.yaml")).unwrap();
    assert_eq!(config.manifest_urls().unwrap().len(), 7);
    assert_eq!(config.strategy, Strategy::NetworkFirst);
  }

  #[test]
  fn test_empty_version_rejected() {
    let yaml = r#"
version: "  "
scope: https://a.test/
manifest: ["./index.html"]
"#;
    assert!(Config::parse(yaml).is_err());
  }
}
