//! The three caching strategies and image cache trimming.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ServiceWorker, Served};
use crate::cache::CacheStorage;
use crate::error::{StoreError, WorkerError};
use crate::http::{Request, RequestKey, Response};
use crate::network::Fetcher;

impl<S, F> ServiceWorker<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  /// Network-first.
  ///
  /// 1. Fetch live; on success mirror into the shell cache in the background
  /// 2. On network failure, serve the shell cache copy
  /// 3. Otherwise serve the offline fallback document
  pub(super) async fn navigation(&self, request: Request) -> Served {
    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        self.store_in_background(&self.config.shell_cache_name, request.key(), &response);
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Navigation fetch failed; trying cache");
        match self.lookup(&self.config.shell_cache_name, &request.key()).await {
          Some(cached) => Served::from_cache(cached),
          None => self.offline_document().await,
        }
      }
    }
  }

  /// Cache-first with bounded insertion-order eviction.
  pub(super) async fn image(&self, request: Request) -> Served {
    let cache = &self.config.image_cache_name;
    let key = request.key();

    if let Some(cached) = self.lookup(cache, &key).await {
      return Served::from_cache(cached);
    }

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_image_in_background(key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Image fetch failed; serving fallback");
        self.offline_image().await
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A cached copy is returned at once while a background fetch refreshes
  /// it. Without a cached copy the live fetch is awaited and its failure
  /// reaches the caller.
  pub(super) async fn static_asset(&self, request: Request) -> Result<Served, WorkerError> {
    let cache = &self.config.shell_cache_name;
    let key = request.key();

    match self.lookup(cache, &key).await {
      Some(cached) => {
        let storage = Arc::clone(&self.storage);
        let fetcher = Arc::clone(&self.fetcher);
        let cache = cache.clone();
        self.background.spawn("revalidate", async move {
          let response = fetcher.fetch(&request).await?;
          if response.is_ok() {
            storage.put(&cache, &key, &response).await?;
            debug!(url = %key.url, "Revalidated cached asset");
          }
          Ok::<(), WorkerError>(())
        });
        Ok(Served::from_cache(cached))
      }
      None => {
        let response = self.fetcher.fetch(&request).await?;
        self.store_in_background(cache, key, &response);
        Ok(Served::from_network(response))
      }
    }
  }

  /// Cache lookup where a storage failure counts as a miss.
  async fn lookup(&self, cache: &str, key: &RequestKey) -> Option<crate::cache::CachedResponse> {
    match self.storage.match_in(cache, key).await {
      Ok(found) => found,
      Err(e) => {
        warn!(cache, url = %key.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// The precached offline document, or a synthesized 503 if even that is gone.
  async fn offline_document(&self) -> Served {
    let key = RequestKey::get(&self.config.offline_fallback);
    match self.lookup(&self.config.shell_cache_name, &key).await {
      Some(cached) => Served::fallback(cached.response, Some(cached.cached_at)),
      None => {
        warn!(url = %key.url, "Offline fallback is not cached");
        Served::fallback(Response::offline_unavailable(), None)
      }
    }
  }

  /// The placeholder image when one is configured and cached, else the
  /// offline document.
  async fn offline_image(&self) -> Served {
    if let Some(placeholder) = &self.config.offline_image_fallback {
      let key = RequestKey::get(placeholder);
      if let Some(cached) = self.lookup(&self.config.shell_cache_name, &key).await {
        return Served::fallback(cached.response, Some(cached.cached_at));
      }
    }
    self.offline_document().await
  }

  /// Best-effort copy of a 2xx response into `cache`.
  fn store_in_background(&self, cache: &str, key: RequestKey, response: &Response) {
    if !response.is_ok() {
      debug!(url = %key.url, status = response.status, "Not caching error response");
      return;
    }

    let storage = Arc::clone(&self.storage);
    let cache = cache.to_string();
    let response = response.clone();
    self.background.spawn("cache-put", async move {
      storage.put(&cache, &key, &response).await
    });
  }

  /// Store an image, then trim the image cache back to its bound.
  fn store_image_in_background(&self, key: RequestKey, response: &Response) {
    let storage = Arc::clone(&self.storage);
    let trim_lock = Arc::clone(&self.trim_lock);
    let cache = self.config.image_cache_name.clone();
    let max = self.config.max_image_entries;
    let response = response.clone();

    self.background.spawn("image-cache", async move {
      if let Err(e) = storage.put(&cache, &key, &response).await {
        warn!(url = %key.url, error = %e, "Failed to cache image");
      }
      // keep cache bounded
      let _guard = trim_lock.lock().await;
      trim_cache(storage.as_ref(), &cache, max).await.map(|_| ())
    });
  }
}

/// Delete the `len - max` least recently inserted entries of `cache`.
///
/// Returns how many entries were removed.
pub async fn trim_cache<S>(storage: &S, cache: &str, max: usize) -> Result<usize, StoreError>
where
  S: CacheStorage + ?Sized,
{
  let keys = storage.keys(cache).await?;
  if keys.len() <= max {
    return Ok(0);
  }

  let excess = keys.len() - max;
  info!(cache, count = excess, "Trimming cache: removing old entries");
  for key in keys.iter().take(excess) {
    storage.delete(cache, key).await?;
  }
  Ok(excess)
}

#[cfg(test)]
mod tests {
  use super::super::fixtures::*;
  use super::super::*;
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::network::testing::FakeFetcher;

  async fn worker_with(fetcher: Arc<FakeFetcher>) -> (TestWorker, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let worker = active_worker(config("1.0.0"), storage.clone(), fetcher).await;
    (worker, storage)
  }

  async fn fetch(worker: &TestWorker, request: Request) -> Served {
    served(worker.handle_fetch(request).await.unwrap())
  }

  // Navigation

  #[tokio::test]
  async fn test_navigation_returns_live_and_mirrors() {
    let fetcher = online_fetcher();
    let (worker, storage) = worker_with(fetcher.clone()).await;
    fetcher.route_text(url("./cart").as_str(), "cart v1");

    let live = fetch(&worker, Request::navigate(url("./cart"))).await;
    assert_eq!(live.source, ResponseSource::Network);
    assert_eq!(live.response.body, b"cart v1");
    worker.settle().await;

    fetcher.route_text(url("./cart").as_str(), "cart v2");
    let live = fetch(&worker, Request::navigate(url("./cart"))).await;
    assert_eq!(live.response.body, b"cart v2");
    worker.settle().await;

    fetcher.set_offline(true);
    let offline = fetch(&worker, Request::navigate(url("./cart"))).await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response.body, b"cart v2");
    assert!(storage
      .match_in("tapioca-v1-0-0", &RequestKey::get(&url("./cart")))
      .await
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_navigation_offline_without_copy_serves_fallback() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.set_offline(true);

    let served = fetch(&worker, Request::navigate(url("./never-visited"))).await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body, b"shell ./offline.html");
  }

  #[tokio::test]
  async fn test_navigation_without_fallback_still_resolves() {
    let fetcher = online_fetcher();
    fetcher.fail(url("./offline.html").as_str());
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.set_offline(true);

    let served = fetch(&worker, Request::navigate(url("./"))).await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() {
    let fetcher = online_fetcher();
    let (worker, storage) = worker_with(fetcher.clone()).await;

    let served = fetch(&worker, Request::navigate(url("./missing"))).await;
    assert_eq!(served.response.status, 404);
    worker.settle().await;
    assert!(storage
      .match_in("tapioca-v1-0-0", &RequestKey::get(&url("./missing")))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_cache_write_failure_does_not_affect_response() {
    let fetcher = online_fetcher();
    let storage = Arc::new(MemoryStorage::with_quota(0));
    let worker = active_worker(config("1.0.0"), storage.clone(), fetcher.clone()).await;
    fetcher.route_text(url("./about").as_str(), "about us");
    fetcher.route_text(url("./hero.png").as_str(), "png");

    let page = fetch(&worker, Request::navigate(url("./about"))).await;
    assert_eq!(page.response.body, b"about us");
    let image = fetch(&worker, Request::image(url("./hero.png"))).await;
    assert_eq!(image.response.body, b"png");

    worker.settle().await;
    assert_eq!(storage.len("tapioca-images-v1").await.unwrap(), 0);
    assert!(worker.is_controlling());
  }

  // Images

  #[tokio::test]
  async fn test_image_second_request_skips_network() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    let image = url("./assets/products/taro.webp");
    fetcher.route_text(image.as_str(), "taro");

    let first = fetch(&worker, Request::get(image.clone())).await;
    assert_eq!(first.source, ResponseSource::Network);
    worker.settle().await;

    let second = fetch(&worker, Request::get(image.clone())).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, b"taro");
    assert_eq!(fetcher.calls_to(image.as_str()), 1);
  }

  #[tokio::test]
  async fn test_image_offline_falls_back_to_offline_document() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.set_offline(true);

    let served = fetch(&worker, Request::image(url("./assets/products/matcha.jpg"))).await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body, b"shell ./offline.html");
  }

  #[tokio::test]
  async fn test_image_offline_prefers_placeholder_image() {
    let fetcher = online_fetcher();
    fetcher.route_text(url("./assets/offline.svg").as_str(), "<svg/>");
    let config = WorkerConfig::new(
      &url("./"),
      "tapioca",
      "1.0.0",
      MANIFEST.iter().chain(["./assets/offline.svg"].iter()),
      "./offline.html",
    )
    .unwrap()
    .with_offline_image_fallback(Some(url("./assets/offline.svg")));
    let worker = active_worker(config, Arc::new(MemoryStorage::new()), fetcher.clone()).await;
    fetcher.set_offline(true);

    let served = fetch(&worker, Request::image(url("./assets/products/matcha.jpg"))).await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body, b"<svg/>");
  }

  #[tokio::test]
  async fn test_image_cache_keeps_most_recent_entries() {
    let fetcher = online_fetcher();
    let (worker, storage) = worker_with(fetcher.clone()).await;

    for i in 0..51 {
      let image = url(&format!("./img/{}.png", i));
      fetcher.route_text(image.as_str(), &i.to_string());
      fetch(&worker, Request::get(image)).await;
      worker.settle().await;
    }

    let keys = storage.keys("tapioca-images-v1").await.unwrap();
    assert_eq!(keys.len(), 50);
    assert_eq!(keys.first(), Some(&RequestKey::get(&url("./img/1.png"))));
    assert_eq!(keys.last(), Some(&RequestKey::get(&url("./img/50.png"))));
    assert!(storage
      .match_in("tapioca-images-v1", &RequestKey::get(&url("./img/0.png")))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_concurrent_image_loads_stay_bounded() {
    let fetcher = online_fetcher();
    let storage = Arc::new(MemoryStorage::new());
    let config = config("1.0.0").with_max_image_entries(3);
    let worker = active_worker(config, storage.clone(), fetcher.clone()).await;

    let requests = (0..10).map(|i| {
      let image = url(&format!("./img/{}.gif", i));
      fetcher.route_text(image.as_str(), "gif");
      worker.handle_fetch(Request::get(image))
    });
    for outcome in futures::future::join_all(requests).await {
      assert_eq!(served(outcome.unwrap()).source, ResponseSource::Network);
    }
    worker.settle().await;

    assert_eq!(storage.len("tapioca-images-v1").await.unwrap(), 3);
  }

  #[tokio::test]
  async fn test_trim_removes_exactly_the_excess() {
    let storage = MemoryStorage::new();
    for i in 0..7 {
      storage
        .put("images", &RequestKey::get(&url(&format!("{}.png", i))), &Response::new(200))
        .await
        .unwrap();
    }

    assert_eq!(trim_cache(&storage, "images", 10).await.unwrap(), 0);
    assert_eq!(trim_cache(&storage, "images", 4).await.unwrap(), 3);
    let keys = storage.keys("images").await.unwrap();
    assert_eq!(keys.len(), 4);
    assert_eq!(keys[0], RequestKey::get(&url("3.png")));
    assert_eq!(trim_cache(&storage, "images", 4).await.unwrap(), 0);
  }

  // Static assets

  #[tokio::test]
  async fn test_static_asset_serves_stale_then_updated() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.route_text(url("./styles.css").as_str(), "body { color: teal }");

    let stale = fetch(&worker, Request::get(url("./styles.css"))).await;
    assert_eq!(stale.source, ResponseSource::Cache);
    assert_eq!(stale.response.body, b"shell ./styles.css");

    worker.settle().await;
    let fresh = fetch(&worker, Request::get(url("./styles.css"))).await;
    assert_eq!(fresh.source, ResponseSource::Cache);
    assert_eq!(fresh.response.body, b"body { color: teal }");
  }

  #[tokio::test]
  async fn test_static_asset_failed_revalidation_keeps_copy() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.set_offline(true);

    let served = fetch(&worker, Request::get(url("./styles.css"))).await;
    assert_eq!(served.source, ResponseSource::Cache);
    worker.settle().await;

    let served = fetch(&worker, Request::get(url("./styles.css"))).await;
    assert_eq!(served.response.body, b"shell ./styles.css");
  }

  #[tokio::test]
  async fn test_static_asset_miss_fetches_and_caches() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.route_text(url("./script.js").as_str(), "console.log(1)");

    let served = fetch(&worker, Request::get(url("./script.js"))).await;
    assert_eq!(served.source, ResponseSource::Network);
    worker.settle().await;

    fetcher.set_offline(true);
    let served = fetch(&worker, Request::get(url("./script.js"))).await;
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"console.log(1)");
  }

  #[tokio::test]
  async fn test_static_asset_miss_propagates_network_failure() {
    let fetcher = online_fetcher();
    let (worker, _) = worker_with(fetcher.clone()).await;
    fetcher.set_offline(true);

    let err = worker
      .handle_fetch(Request::get(url("./fonts/brand.woff2")))
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::Fetch(_)));

    // The worker keeps answering afterwards
    let served = fetch(&worker, Request::navigate(url("./"))).await;
    assert_eq!(served.source, ResponseSource::Cache);
  }

  // Generations

  #[tokio::test]
  async fn test_version_bump_migrates_shell_cache() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = online_fetcher();

    let old = active_worker(config("1.0.0"), storage.clone(), fetcher.clone()).await;
    fetcher.route_text(url("./logo.png").as_str(), "logo");
    fetch(&old, Request::get(url("./logo.png"))).await;
    old.settle().await;

    fetcher.route_text(url("./").as_str(), "home v2");
    let new = ServiceWorker::new(config("1.0.1"), storage.clone(), fetcher.clone());
    let registration = new.register().await.unwrap();
    match registration {
      Registration::Installed { activation, .. } => {
        assert_eq!(activation.purged, vec!["tapioca-v1-0-0"]);
      }
      other => panic!("expected a fresh install, got {:?}", other),
    }

    assert!(!storage.has("tapioca-v1-0-0").await.unwrap());
    assert_eq!(storage.len("tapioca-images-v1").await.unwrap(), 1);

    fetcher.set_offline(true);
    let home = fetch(&new, Request::navigate(url("./"))).await;
    assert_eq!(home.source, ResponseSource::Cache);
    assert_eq!(home.response.body, b"home v2");
  }
}
