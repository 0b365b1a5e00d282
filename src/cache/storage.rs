//! Bucket storage backends: SQLite and a no-op pass-through.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CacheStorage, CachedEntry};
use crate::request::{AssetResponse, RequestKey};

/// Storage implementation that doesn't cache anything.
/// Used when the real backend cannot be opened - all operations are no-ops,
/// so every request degrades to plain networking.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open_bucket(&self, _bucket: &str) -> Result<()> {
    Ok(())
  }

  fn has_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _bucket: &str, _key: &RequestKey) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _bucket: &str, _key: &RequestKey, _response: &AssetResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _bucket: &str, _entries: &[(RequestKey, AssetResponse)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn entries(&self, _bucket: &str) -> Result<Vec<CachedEntry>> {
    Ok(Vec::new())
  }
}

/// SQLite-based bucket storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named bucket
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by bucket + request identity
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, method, url)
);
"#;

/// Insert or replace one entry. The bucket must already exist.
fn put_entry(
  conn: &Connection,
  bucket: &str,
  key: &RequestKey,
  response: &AssetResponse,
) -> Result<()> {
  let exists: bool = conn
    .query_row(
      "SELECT EXISTS(SELECT 1 FROM buckets WHERE name = ?)",
      params![bucket],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;

  if !exists {
    return Err(eyre!("Bucket {} does not exist", bucket));
  }

  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (bucket, method, url, status, headers, body, digest, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        key.method,
        key.url,
        response.status,
        headers,
        response.body,
        digest(&response.body)
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

type EntryRow = (String, String, u16, String, Vec<u8>, String, String);

fn entry_from_row(row: EntryRow) -> Result<CachedEntry> {
  let (method, url, status, headers, body, digest, cached_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

  Ok(CachedEntry {
    key: RequestKey { method, url },
    response: AssetResponse {
      status,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
    digest,
  })
}

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, bucket: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, datetime('now'))",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    Ok(())
  }

  fn has_bucket(&self, bucket: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM buckets WHERE name = ?)",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;

    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT method, url, status, headers, body, digest, cached_at FROM entries
         WHERE bucket = ? AND method = ? AND url = ?",
        params![bucket, key.method, key.url],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(entry_from_row).transpose()
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &AssetResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    put_entry(&conn, bucket, key, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, AssetResponse)]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, datetime('now'))",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    for (key, response) in entries {
      put_entry(&tx, bucket, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, bucket: &str) -> Result<Vec<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, headers, body, digest, cached_at FROM entries
         WHERE bucket = ?
         ORDER BY url, method",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<EntryRow>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows.into_iter().map(entry_from_row).collect()
  }
}

/// Hex SHA-256 of a response body.
pub fn digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(url: &str) -> RequestKey {
    RequestKey {
      method: "GET".to_string(),
      url: url.to_string(),
    }
  }

  #[test]
  fn test_put_and_get_roundtrip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();

    let response = AssetResponse::new(200, "<html>").with_header("content-type", "text/html");
    storage.put("v1", &key("https://a.test/"), &response).unwrap();

    let entry = storage.get("v1", &key("https://a.test/")).unwrap().unwrap();
    assert_eq!(entry.response, response);
    assert_eq!(entry.digest, digest(b"<html>"));
    assert!(storage.get("v1", &key("https://a.test/other")).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();
    storage
      .put("v1", &key("https://a.test/app.js"), &AssetResponse::new(200, "old"))
      .unwrap();
    storage
      .put("v1", &key("https://a.test/app.js"), &AssetResponse::new(200, "new"))
      .unwrap();

    let entries = storage.entries("v1").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.body, b"new");
  }

  #[test]
  fn test_put_into_missing_bucket_fails() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let result = storage.put("gone", &key("https://a.test/"), &AssetResponse::new(200, ""));
    assert!(result.is_err());
    assert!(!storage.has_bucket("gone").unwrap());
  }

  #[test]
  fn test_buckets_are_isolated() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();
    storage.open_bucket("v2").unwrap();
    storage
      .put("v1", &key("https://a.test/"), &AssetResponse::new(200, "one"))
      .unwrap();

    assert!(storage.get("v2", &key("https://a.test/")).unwrap().is_none());
    assert_eq!(storage.bucket_names().unwrap().len(), 2);
  }

  #[test]
  fn test_delete_bucket_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all(
        "v1",
        &[
          (key("https://a.test/"), AssetResponse::new(200, "a")),
          (key("https://a.test/b"), AssetResponse::new(200, "b")),
        ],
      )
      .unwrap();
    assert_eq!(storage.entries("v1").unwrap().len(), 2);

    assert!(storage.delete_bucket("v1").unwrap());
    assert!(!storage.delete_bucket("v1").unwrap());
    assert!(storage.entries("v1").unwrap().is_empty());
    assert!(storage.bucket_names().unwrap().is_empty());
  }

  #[test]
  fn test_noop_storage_never_stores() {
    let storage = NoopStorage;
    storage.open_bucket("v1").unwrap();
    storage
      .put("v1", &key("https://a.test/"), &AssetResponse::new(200, "a"))
      .unwrap();
    assert!(storage.get("v1", &key("https://a.test/")).unwrap().is_none());
    assert!(!storage.has_bucket("v1").unwrap());
  }
}
