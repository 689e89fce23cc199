//! Core trait and types for the cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::http::{RequestKey, Response};

/// A response snapshot as held by a named cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  /// The stored snapshot
  pub response: Response,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches. Within one cache, entries are
/// keyed by request identity and remember the order they were inserted in; a
/// `put` over an existing identity replaces the whole entry and moves it to
/// the newest position.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  async fn open(&self, cache: &str) -> Result<(), StoreError>;

  /// Whether the named cache exists.
  async fn has(&self, cache: &str) -> Result<bool, StoreError>;

  /// Names of all caches, oldest first.
  async fn cache_names(&self) -> Result<Vec<String>, StoreError>;

  /// Delete a cache and all of its entries.
  ///
  /// Returns `false` if there was nothing to delete.
  async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError>;

  /// Look up an entry in one cache.
  async fn match_in(
    &self,
    cache: &str,
    key: &RequestKey,
  ) -> Result<Option<CachedResponse>, StoreError>;

  /// Store a snapshot, creating the cache if needed.
  async fn put(&self, cache: &str, key: &RequestKey, response: &Response)
    -> Result<(), StoreError>;

  /// Delete one entry. Returns `false` if it was not present.
  async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, StoreError>;

  /// Entry identities of one cache, least recently inserted first.
  async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, StoreError>;

  /// Number of entries in one cache.
  async fn len(&self, cache: &str) -> Result<usize, StoreError> {
    Ok(self.keys(cache).await?.len())
  }
}
