mod cache;
mod config;
mod controller;
mod net;
mod request;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheStorage, NoopStorage, SqliteStorage};
use config::Config;
use controller::Controller;
use net::{Fetcher, HttpFetcher};
use request::AssetRequest;
use worker::CacheWorker;

#[derive(Parser, Debug)]
#[command(name = "roma-cache")]
#[command(about = "Offline asset cache for the Roma Explorer companion app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/roma-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Version tag to use instead of the one in the config file
  #[arg(long)]
  version_tag: Option<String>,

  /// Cache database to use instead of the configured one
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch the manifest into a new bucket for this version
  Install,
  /// Evict every bucket that does not belong to this version
  Activate,
  /// Install, then activate
  Update,
  /// Serve one request through the active version
  Fetch {
    /// Absolute URL, or a path relative to the configured scope
    url: String,
    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List buckets and their entries
  Status,
  /// Delete every bucket
  Purge,
}

/// Log to a daily file in the data directory, and warnings to stderr.
///
/// Use RUST_LOG to control the file log level (e.g., RUST_LOG=debug).
/// If the log directory is unusable only the stderr log is kept.
fn init_tracing() -> Option<WorkerGuard> {
  let file = config::data_dir()
    .map(|dir| dir.join("logs"))
    .and_then(|dir| file_log_writer(&dir));

  let (file_layer, guard, file_error) = match file {
    Ok((writer, guard)) => {
      let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter);
      (Some(layer), Some(guard), None)
    }
    Err(e) => (None, None, Some(e)),
  };

  tracing_subscriber::registry()
    .with(file_layer)
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new("warn")),
    )
    .init();

  if let Some(e) = file_error {
    tracing::warn!("File logging disabled: {:#}", e);
  }

  guard
}

/// Daily rolling writer for `log_dir`, created if missing.
fn file_log_writer(log_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  Ok(tracing_appender::non_blocking(
    tracing_appender::rolling::daily(log_dir, "roma-cache.log"),
  ))
}

/// Open the cache database, or run uncached if that is impossible.
fn open_storage(config: &Config) -> Arc<dyn CacheStorage> {
  match SqliteStorage::open(config.storage_path.as_deref()) {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      tracing::warn!("Caching disabled: {:#}", e);
      Arc::new(NoopStorage)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override version and database if specified on command line
  let config = Config {
    version: args.version_tag.unwrap_or(config.version),
    storage_path: args.db.or(config.storage_path),
    ..config
  };

  let storage = open_storage(&config);
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout())?);
  let worker = Arc::new(CacheWorker::from_config(
    &config,
    Arc::clone(&storage),
    Arc::clone(&fetcher),
  )?);
  let controller = Controller::new(Arc::clone(&fetcher));

  match args.command {
    Command::Install => {
      let report = worker.install().await?;
      println!("Installed {} ({} assets)", worker.version(), report.cached.len());
      for (url, reason) in &report.failed {
        println!("  skipped {}: {}", url, reason);
      }
    }
    Command::Activate => {
      worker.adopt()?;
      let report = worker.activate().await?;
      controller.claim(Arc::clone(&worker))?;
      print_activation(worker.version(), &report);
    }
    Command::Update => {
      controller.register(Arc::clone(&worker)).await?;
      println!(
        "Installed and activated {}",
        controller.active_version().unwrap_or_default()
      );
    }
    Command::Fetch {
      url,
      method,
      navigate,
      output,
    } => {
      if let Err(e) = controller.resume(Arc::clone(&worker)) {
        tracing::warn!("Serving uncached: {:#}", e);
      }

      let url = request::resolve(&config.scope, &url)?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let request = if navigate {
        AssetRequest {
          method,
          ..AssetRequest::navigate(url)
        }
      } else {
        AssetRequest::new(method, url)
      };

      let result = controller.handle(request).await?;
      let failed_writes = controller.settle().await;
      if failed_writes > 0 {
        tracing::warn!("{} cache writes failed", failed_writes);
      }

      eprintln!(
        "{} {:?} {}{}",
        result.response.status,
        result.source,
        result.response.header("content-type").unwrap_or("-"),
        result
          .cached_at
          .map(|t| format!(" (cached {})", t.format("%Y-%m-%d %H:%M:%S")))
          .unwrap_or_default()
      );
      match output {
        Some(path) => std::fs::write(&path, &result.response.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout()
          .write_all(&result.response.body)
          .map_err(|e| eyre!("Failed to write body: {}", e))?,
      }
    }
    Command::Status => print_status(&config, storage.as_ref())?,
    Command::Purge => {
      for name in storage.bucket_names()? {
        storage.delete_bucket(&name)?;
        println!("Deleted {}", name);
      }
    }
  }

  Ok(())
}

fn print_activation(version: &str, report: &worker::ActivateReport) {
  println!("Activated {}", version);
  for name in &report.evicted {
    println!("  evicted {}", name);
  }
  for name in &report.failed {
    println!("  could not evict {}", name);
  }
}

fn print_status(config: &Config, storage: &dyn CacheStorage) -> Result<()> {
  println!("version:  {}", config.version);
  println!("strategy: {}", config.strategy);

  let names = storage.bucket_names()?;
  if names.is_empty() {
    println!("no buckets");
    return Ok(());
  }

  for name in names {
    let marker = if name == config.version { "*" } else { " " };
    let entries = storage.entries(&name)?;
    println!("{} {} ({} entries)", marker, name, entries.len());
    for entry in entries {
      println!(
        "    {} {:>8} {} {} {}",
        entry.response.status,
        entry.response.body.len(),
        &entry.digest[..12.min(entry.digest.len())],
        entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
        entry.key
      );
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_log_writer_creates_directory() {
    let dir = std::env::temp_dir()
      .join(format!("roma-cache-logs-{}", std::process::id()))
      .join("logs");
    let _ = std::fs::remove_dir_all(&dir);

    let (_writer, _guard) = file_log_writer(&dir).unwrap();
    assert!(dir.is_dir());
  }

  #[test]
  fn test_file_log_writer_reports_unusable_directory() {
    let file = std::env::temp_dir().join(format!("roma-cache-not-a-dir-{}", std::process::id()));
    std::fs::write(&file, "x").unwrap();

    let err = file_log_writer(&file.join("logs")).unwrap_err();
    assert!(err.to_string().contains("Failed to create log directory"));

    std::fs::remove_file(&file).unwrap();
  }
}
