//! Cache storage trait and SQLite implementation.
//!
//! Storage is organized as named cache generations, each holding responses
//! keyed by request identity. Generations are created on open or first write and
//! only ever removed whole.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey};
use crate::db;
use crate::net::FetchResponse;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Names of every cache generation present.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Create an empty generation if it does not exist yet.
  fn open_cache(&self, name: &str) -> Result<()>;

  /// Delete a whole generation. Returns whether it existed.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Store or overwrite one response.
  fn put(&self, cache_name: &str, key: &RequestKey, response: &FetchResponse) -> Result<()>;

  /// Store a batch atomically: either every entry lands or none does.
  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, FetchResponse)]) -> Result<()>;

  /// Look up a response in one generation.
  fn get(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Look up a response in the given generations, first match wins.
  fn match_any(&self, cache_names: &[String], key: &RequestKey) -> Result<Option<CachedResponse>> {
    for name in cache_names {
      if let Some(found) = self.get(name, key)? {
        return Ok(Some(found));
      }
    }
    Ok(None)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open cache storage in the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Self::with_connection(db::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(db::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    db::migrate(&conn, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_hash)
);
"#;

fn insert_entry(
  conn: &Connection,
  cache_name: &str,
  key: &RequestKey,
  response: &FetchResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache_name, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, request_hash, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache_name,
        key.cache_hash(),
        key.url(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url(), cache_name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn open_cache(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;
    Ok(())
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, cache_name: &str, key: &RequestKey, response: &FetchResponse) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, cache_name, key, response)
  }

  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, FetchResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, cache_name, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![cache_name, key.cache_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: FetchResponse {
            status,
            headers,
            body,
          },
          cache_name: cache_name.to_string(),
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }
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
  use crate::net::FetchRequest;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    let url = Url::parse("https://app.example.com").unwrap().join(path).unwrap();
    RequestKey::for_request(&FetchRequest::get(url)).unwrap()
  }

  #[test]
  fn test_put_then_get_roundtrips_headers() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = FetchResponse::new(200, "<html>").with_header("content-type", "text/html");

    storage.put("v1-runtime", &key("/a"), &response).unwrap();

    let cached = storage.get("v1-runtime", &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response, response);
    assert_eq!(cached.cache_name, "v1-runtime");
    assert!(storage.get("v1-shell", &key("/a")).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("v1-runtime", &key("/a"), &FetchResponse::new(200, "old"))
      .unwrap();
    storage
      .put("v1-runtime", &key("/a"), &FetchResponse::new(200, "new"))
      .unwrap();

    let cached = storage.get("v1-runtime", &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response.body_text(), "new");
  }

  #[test]
  fn test_delete_cache_removes_only_that_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("v1-shell", &key("/"), &FetchResponse::new(200, "v1"))
      .unwrap();
    storage
      .put("v2-shell", &key("/"), &FetchResponse::new(200, "v2"))
      .unwrap();

    assert!(storage.delete_cache("v1-shell").unwrap());
    assert!(!storage.delete_cache("v1-shell").unwrap());

    assert_eq!(storage.cache_names().unwrap(), vec!["v2-shell".to_string()]);
    assert!(storage.get("v1-shell", &key("/")).unwrap().is_none());
    assert!(storage.get("v2-shell", &key("/")).unwrap().is_some());
  }

  #[test]
  fn test_open_cache_creates_empty_generation_once() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_cache("v1-runtime").unwrap();
    storage.open_cache("v1-runtime").unwrap();

    assert_eq!(storage.cache_names().unwrap(), vec!["v1-runtime".to_string()]);
  }

  #[test]
  fn test_match_any_respects_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("shell", &key("/x"), &FetchResponse::new(200, "shell"))
      .unwrap();
    storage
      .put("runtime", &key("/x"), &FetchResponse::new(200, "runtime"))
      .unwrap();

    let names = vec!["runtime".to_string(), "shell".to_string()];
    let found = storage.match_any(&names, &key("/x")).unwrap().unwrap();
    assert_eq!(found.response.body_text(), "runtime");
  }
}
