//! In-memory cache store.
//!
//! Used by `--memory` runs and by tests in place of SQLite. An optional byte
//! quota makes writes fail the way a full browser cache would.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, CachedResponse};
use crate::error::StoreError;
use crate::http::{RequestKey, Response};

#[derive(Default)]
struct NamedCache {
  created: u64,
  /// seq -> entry, so iteration is insertion order
  entries: BTreeMap<u64, (RequestKey, CachedResponse)>,
  index: HashMap<RequestKey, u64>,
}

impl NamedCache {
  fn remove(&mut self, key: &RequestKey) -> bool {
    match self.index.remove(key) {
      Some(seq) => self.entries.remove(&seq).is_some(),
      None => false,
    }
  }

  fn bytes(&self) -> usize {
    self
      .entries
      .values()
      .map(|(_, cached)| cached.response.body.len())
      .sum()
  }
}

#[derive(Default)]
struct State {
  next_seq: u64,
  caches: HashMap<String, NamedCache>,
}

impl State {
  fn seq(&mut self) -> u64 {
    self.next_seq += 1;
    self.next_seq
  }

  fn open(&mut self, cache: &str) -> &mut NamedCache {
    let State { next_seq, caches } = self;
    caches.entry(cache.to_string()).or_insert_with(|| {
      *next_seq += 1;
      NamedCache {
        created: *next_seq,
        ..NamedCache::default()
      }
    })
  }

  fn usage(&self) -> usize {
    self.caches.values().map(NamedCache::bytes).sum()
  }
}

/// Cache store held entirely in memory.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<State>,
  /// Maximum total body bytes across all caches
  quota: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Limit the total body bytes the store accepts.
  pub fn with_quota(quota: usize) -> Self {
    Self {
      quota: Some(quota),
      ..Self::default()
    }
  }

  fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
    self.state.lock().map_err(|_| StoreError::Poisoned)
  }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
  async fn open(&self, cache: &str) -> Result<(), StoreError> {
    self.state()?.open(cache);
    Ok(())
  }

  async fn has(&self, cache: &str) -> Result<bool, StoreError> {
    Ok(self.state()?.caches.contains_key(cache))
  }

  async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
    let state = self.state()?;
    let mut names: Vec<(u64, String)> = state
      .caches
      .iter()
      .map(|(name, cache)| (cache.created, name.clone()))
      .collect();
    names.sort();
    Ok(names.into_iter().map(|(_, name)| name).collect())
  }

  async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError> {
    Ok(self.state()?.caches.remove(cache).is_some())
  }

  async fn match_in(
    &self,
    cache: &str,
    key: &RequestKey,
  ) -> Result<Option<CachedResponse>, StoreError> {
    let state = self.state()?;
    let found = state.caches.get(cache).and_then(|c| {
      c.index
        .get(key)
        .and_then(|seq| c.entries.get(seq))
        .map(|(_, cached)| cached.clone())
    });
    Ok(found)
  }

  async fn put(
    &self,
    cache: &str,
    key: &RequestKey,
    response: &Response,
  ) -> Result<(), StoreError> {
    let mut state = self.state()?;

    if let Some(quota) = self.quota {
      let replaced = state
        .caches
        .get(cache)
        .and_then(|c| c.index.get(key).and_then(|seq| c.entries.get(seq)))
        .map(|(_, cached)| cached.response.body.len())
        .unwrap_or(0);
      let needed = state.usage() - replaced + response.body.len();
      if needed > quota {
        return Err(StoreError::QuotaExceeded { needed, quota });
      }
    }

    let seq = state.seq();
    let named = state.open(cache);
    named.remove(key);
    named.index.insert(key.clone(), seq);
    named.entries.insert(
      seq,
      (
        key.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      ),
    );
    Ok(())
  }

  async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, StoreError> {
    let mut state = self.state()?;
    Ok(
      state
        .caches
        .get_mut(cache)
        .map(|c| c.remove(key))
        .unwrap_or(false),
    )
  }

  async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, StoreError> {
    let state = self.state()?;
    Ok(
      state
        .caches
        .get(cache)
        .map(|c| c.entries.values().map(|(key, _)| key.clone()).collect())
        .unwrap_or_default(),
    )
  }

  async fn len(&self, cache: &str) -> Result<usize, StoreError> {
    Ok(
      self
        .state()?
        .caches
        .get(cache)
        .map(|c| c.entries.len())
        .unwrap_or(0),
    )
  }
}
