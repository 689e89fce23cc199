//! The offline worker: lifecycle, request routing and caching strategies.
//!
//! A [`ServiceWorker`] owns two named caches in an injected [`CacheStorage`]:
//! the versioned shell cache populated at install time, and the unversioned
//! image cache bounded by insertion-order eviction. Requests enter through
//! [`ServiceWorker::handle_fetch`] once the worker is active and controlling.

mod background;
mod lifecycle;
mod router;
mod strategy;

pub use background::Background;
pub use lifecycle::{Registration, WorkerState};
pub use router::{classify, Route};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse};
use crate::error::WorkerError;
use crate::http::{Request, Response};
use crate::network::Fetcher;

/// Name of the versioned shell cache: `1.0.1` becomes `<app>-v1-0-1`.
pub fn shell_cache_name(app_name: &str, app_version: &str) -> String {
  format!("{}-v{}", app_name, app_version.replace('.', "-"))
}

/// Name of the runtime image cache, fixed across deployments.
pub fn image_cache_name(app_name: &str) -> String {
  format!("{}-images-v1", app_name)
}

/// Everything the worker needs to know about its deployment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub shell_cache_name: String,
  pub image_cache_name: String,
  pub max_image_entries: usize,
  /// Fetched and stored at install time, in order
  pub manifest: Vec<Url>,
  pub offline_fallback: Url,
  /// Placeholder served for images that can be neither fetched nor found
  pub offline_image_fallback: Option<Url>,
  /// Fail the install when precaching fails instead of degrading
  pub strict_install: bool,
}

impl WorkerConfig {
  pub const DEFAULT_MAX_IMAGE_ENTRIES: usize = 50;

  /// Build a config for `origin`, resolving manifest paths against it.
  pub fn new<I, P>(
    origin: &Url,
    app_name: &str,
    app_version: &str,
    manifest: I,
    offline_fallback: &str,
  ) -> Result<Self, url::ParseError>
  where
    I: IntoIterator<Item = P>,
    P: AsRef<str>,
  {
    let manifest = manifest
      .into_iter()
      .map(|path| origin.join(path.as_ref()))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      shell_cache_name: shell_cache_name(app_name, app_version),
      image_cache_name: image_cache_name(app_name),
      max_image_entries: Self::DEFAULT_MAX_IMAGE_ENTRIES,
      manifest,
      offline_fallback: origin.join(offline_fallback)?,
      offline_image_fallback: None,
      strict_install: false,
    })
  }

  pub fn with_max_image_entries(mut self, max: usize) -> Self {
    self.max_image_entries = max;
    self
  }

  pub fn with_offline_image_fallback(mut self, url: Option<Url>) -> Self {
    self.offline_image_fallback = url;
    self
  }

  pub fn with_strict_install(mut self, strict: bool) -> Self {
    self.strict_install = strict;
    self
  }

  /// Whether activation keeps the named cache.
  pub fn keeps(&self, cache: &str) -> bool {
    cache == self.shell_cache_name || cache == self.image_cache_name
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  /// Live response from the network
  Network,
  /// Snapshot from a cache, possibly stale
  Cache,
  /// Offline fallback, network and cache both missed
  Fallback,
}

/// A response handed back to the page, with its provenance.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the snapshot was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn fallback(response: Response, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
      cached_at,
    }
  }
}

/// Result of offering a request to the worker.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; the page goes to the network itself
  Passthrough,
  /// The worker answered
  Respond(Served),
}

/// An installable network-intercepting cache for one origin.
pub struct ServiceWorker<S: CacheStorage, F: Fetcher> {
  config: Arc<WorkerConfig>,
  storage: Arc<S>,
  fetcher: Arc<F>,
  lifecycle: Arc<Mutex<lifecycle::Lifecycle>>,
  background: Background,
  /// Serializes image cache trims
  trim_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<S, F> ServiceWorker<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(config: WorkerConfig, storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      config: Arc::new(config),
      storage,
      fetcher,
      lifecycle: Arc::new(Mutex::new(lifecycle::Lifecycle::default())),
      background: Background::new(),
      trim_lock: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// Intercept one request.
  ///
  /// Navigation and image requests always resolve to a response. A static
  /// asset with no cached copy propagates the network failure.
  pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, WorkerError> {
    if !self.is_controlling() {
      return Ok(FetchOutcome::Passthrough);
    }

    let served = match classify(&request) {
      Route::Passthrough => return Ok(FetchOutcome::Passthrough),
      Route::Navigation => self.navigation(request).await,
      Route::Image => self.image(request).await,
      Route::StaticAsset => self.static_asset(request).await?,
    };
    Ok(FetchOutcome::Respond(served))
  }

  /// Background cache writes and trims not yet finished.
  pub fn pending_background(&self) -> usize {
    self.background.pending()
  }

  /// Wait for outstanding background cache writes and trims.
  pub async fn settle(&self) {
    self.background.settle().await;
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for ServiceWorker<S, F> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      lifecycle: Arc::clone(&self.lifecycle),
      background: self.background.clone(),
      trim_lock: Arc::clone(&self.trim_lock),
    }
  }
}
