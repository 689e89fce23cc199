//! SQLite implementation of the cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{CacheStorage, CachedResponse};
use crate::error::StoreError;
use crate::http::{RequestKey, Response};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self, StoreError> {
    let open_err = |reason: String| StoreError::Open {
      path: path.to_path_buf(),
      reason,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
    }

    let conn = Connection::open(path).map_err(|e| open_err(e.to_string()))?;
    debug!(path = %path.display(), "Opened cache database");
    Self::with_connection(conn)
  }

  /// A throwaway store that lives as long as the value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Backend("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<(), StoreError> {
    self.conn()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named caches, in creation order
CREATE TABLE IF NOT EXISTS caches (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots; seq is the insertion-order index used for eviction
CREATE TABLE IF NOT EXISTS entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (cache_name, key_hash),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_order ON entries(cache_name, seq);
"#;

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn open(&self, cache: &str) -> Result<(), StoreError> {
    self
      .conn()?
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![cache])?;
    Ok(())
  }

  async fn has(&self, cache: &str) -> Result<bool, StoreError> {
    let found = self
      .conn()?
      .query_row(
        "SELECT 1 FROM caches WHERE name = ?",
        params![cache],
        |_| Ok(()),
      )
      .optional()?;
    Ok(found.is_some())
  }

  async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY seq")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError> {
    let removed = self
      .conn()?
      .execute("DELETE FROM caches WHERE name = ?", params![cache])?;
    Ok(removed > 0)
  }

  async fn match_in(
    &self,
    cache: &str,
    key: &RequestKey,
  ) -> Result<Option<CachedResponse>, StoreError> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE cache_name = ? AND key_hash = ?",
        params![cache, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        response: Response {
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  async fn put(
    &self,
    cache: &str,
    key: &RequestKey,
    response: &Response,
  ) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&response.headers)?;
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    tx.execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![cache])?;
    // REPLACE drops the old row, so the entry takes a fresh seq
    tx.execute(
      "INSERT OR REPLACE INTO entries (cache_name, key_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        key.cache_hash(),
        key.method,
        key.url,
        response.status,
        headers,
        response.body
      ],
    )?;

    tx.commit()?;
    Ok(())
  }

  async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, StoreError> {
    let removed = self.conn()?.execute(
      "DELETE FROM entries WHERE cache_name = ? AND key_hash = ?",
      params![cache, key.cache_hash()],
    )?;
    Ok(removed > 0)
  }

  async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, StoreError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT method, url FROM entries WHERE cache_name = ? ORDER BY seq")?;
    let keys = stmt
      .query_map(params![cache], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
  }

  async fn len(&self, cache: &str) -> Result<usize, StoreError> {
    let count: i64 = self.conn()?.query_row(
      "SELECT COUNT(*) FROM entries WHERE cache_name = ?",
      params![cache],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::Backend(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("https://shop.test/").unwrap().join(path).unwrap())
  }

  fn page(body: &str) -> Response {
    Response::new(200)
      .with_header("content-type", "text/html")
      .with_body(body)
  }

  #[tokio::test]
  async fn test_put_and_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("shell", &key("index.html"), &page("hello")).await.unwrap();

    let cached = storage.match_in("shell", &key("index.html")).await.unwrap().unwrap();
    assert_eq!(cached.response, page("hello"));
    assert!(storage.match_in("shell", &key("other.html")).await.unwrap().is_none());
    assert!(storage.match_in("images", &key("index.html")).await.unwrap().is_none());
    assert!(storage.has("shell").await.unwrap());
  }

  #[tokio::test]
  async fn test_keys_follow_insertion_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    for name in ["c.png", "a.png", "b.png"] {
      storage.put("images", &key(name), &page(name)).await.unwrap();
    }
    // Re-inserting moves the entry to the newest position
    storage.put("images", &key("c.png"), &page("c2")).await.unwrap();

    let keys = storage.keys("images").await.unwrap();
    assert_eq!(keys, vec![key("a.png"), key("b.png"), key("c.png")]);
    assert_eq!(storage.len("images").await.unwrap(), 3);

    let cached = storage.match_in("images", &key("c.png")).await.unwrap().unwrap();
    assert_eq!(cached.response.body, b"c2");
  }

  #[tokio::test]
  async fn test_delete_cache_cascades_and_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("shell-v1").await.unwrap();
    storage.put("shell-v2", &key("index.html"), &page("v2")).await.unwrap();
    assert_eq!(storage.cache_names().await.unwrap(), vec!["shell-v1", "shell-v2"]);

    assert!(storage.delete_cache("shell-v2").await.unwrap());
    assert!(!storage.delete_cache("shell-v2").await.unwrap());
    assert_eq!(storage.len("shell-v2").await.unwrap(), 0);
    assert_eq!(storage.cache_names().await.unwrap(), vec!["shell-v1"]);
  }

  #[tokio::test]
  async fn test_delete_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("images", &key("a.png"), &page("a")).await.unwrap();
    assert!(storage.delete("images", &key("a.png")).await.unwrap());
    assert!(!storage.delete("images", &key("a.png")).await.unwrap());
    assert!(storage.keys("images").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("shell", &key("offline.html"), &page("offline")).await.unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let cached = storage.match_in("shell", &key("offline.html")).await.unwrap();
    assert_eq!(cached.map(|c| c.response.body), Some(b"offline".to_vec()));
  }
}
