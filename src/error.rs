//! Typed errors for the cache store, the network and the worker.
//!
//! The CLI edges report through `color_eyre`; everything below the edges
//! returns one of these so callers can tell a network failure from a
//! storage failure.

use std::path::PathBuf;
use thiserror::Error;

use crate::worker::WorkerState;

/// Failures of the upstream network.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network request to {url} failed: {reason}")]
  Network { url: String, reason: String },

  #[error("network request to {url} timed out")]
  Timeout { url: String },

  #[error("failed to build HTTP client: {0}")]
  Client(String),
}

impl FetchError {
  pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Network {
      url: url.into(),
      reason: reason.into(),
    }
  }

  fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
    if err.is_timeout() {
      Self::Timeout {
        url: url.to_string(),
      }
    } else {
      Self::network(url, err.to_string())
    }
  }
}

/// Convert a reqwest error for the request to `url`.
pub(crate) fn fetch_error(url: &str) -> impl FnOnce(reqwest::Error) -> FetchError + '_ {
  move |err| FetchError::from_reqwest(url, err)
}

/// Failures of a cache storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to open cache database at {path}: {reason}")]
  Open { path: PathBuf, reason: String },

  #[error("cache storage error: {0}")]
  Backend(String),

  #[error("cache storage lock poisoned")]
  Poisoned,

  #[error("failed to encode cached entry: {0}")]
  Encoding(String),

  #[error("cache quota exceeded: {needed} bytes needed, {quota} bytes allowed")]
  QuotaExceeded { needed: usize, quota: usize },
}

impl From<rusqlite::Error> for StoreError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Backend(err.to_string())
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(err: serde_json::Error) -> Self {
    Self::Encoding(err.to_string())
  }
}

/// Failures surfaced by the worker lifecycle and the request strategies.
#[derive(Debug, Error)]
pub enum WorkerError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("precaching failed for {}: {}", failed.len(), failed.join(", "))]
  Precache { failed: Vec<String> },

  #[error("invalid worker state transition from {from:?} to {to:?}")]
  InvalidTransition { from: WorkerState, to: WorkerState },
}
