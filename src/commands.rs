//! CLI subcommands: drive the worker lifecycle and intercept requests
//! against the configured cache store.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::Config;
use crate::http::Request;
use crate::network::{Fetcher, HttpFetcher};
use crate::worker::{
  FetchOutcome, Registration, ResponseSource, Served, ServiceWorker, WorkerConfig,
};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install the current generation: precache the shell and purge stale caches
  Install,

  /// Send one request through the worker
  Fetch {
    /// Path relative to the origin, or an absolute URL
    target: String,

    /// Treat the request as a page navigation
    #[arg(long, conflicts_with = "image")]
    navigate: bool,

    /// Treat the request as an image load
    #[arg(long)]
    image: bool,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Print a JSON summary instead of the body
    #[arg(long)]
    json: bool,
  },

  /// List named caches and whether the current generation keeps them
  Caches,
}

/// Run `command` against the SQLite store, or a fresh in-memory one.
pub async fn execute(command: Command, config: &Config, memory: bool) -> Result<()> {
  let worker_config = config.worker_config()?;
  let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout())?);

  if memory {
    let storage = match config.memory_quota_bytes {
      Some(quota) => MemoryStorage::with_quota(quota),
      None => MemoryStorage::new(),
    };
    debug!(quota = ?config.memory_quota_bytes, "Using in-memory cache store");
    run(command, config, worker_config, Arc::new(storage), fetcher).await
  } else {
    let path = config.database_path()?;
    let storage = SqliteStorage::open_at(&path)?;
    run(command, config, worker_config, Arc::new(storage), fetcher).await
  }
}

async fn run<S, F>(
  command: Command,
  config: &Config,
  worker_config: WorkerConfig,
  storage: Arc<S>,
  fetcher: Arc<F>,
) -> Result<()>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  match command {
    Command::Install => {
      let worker = ServiceWorker::new(worker_config, storage, fetcher);
      install(&worker).await
    }
    Command::Fetch {
      target,
      navigate,
      image,
      method,
      json,
    } => {
      let request = build_request(config, &target, navigate, image, &method)?;
      let worker = ServiceWorker::new(worker_config, storage, Arc::clone(&fetcher));
      fetch(&worker, fetcher.as_ref(), request, json).await
    }
    Command::Caches => caches(storage.as_ref(), &worker_config, &mut std::io::stdout()).await,
  }
}

async fn install<S, F>(worker: &ServiceWorker<S, F>) -> Result<()>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  let precached = worker.install().await?;
  let report = worker.activate().await?;
  let config = worker.config();

  println!(
    "Installed {} ({} of {} assets precached)",
    config.shell_cache_name,
    precached,
    config.manifest.len()
  );
  if worker.skips_waiting() {
    println!("Activated without waiting; open pages are now controlled");
  }
  for name in &report.purged {
    println!("Purged {}", name);
  }
  for name in &report.failed {
    println!("Could not purge {}", name);
  }
  Ok(())
}

async fn fetch<S, F>(
  worker: &ServiceWorker<S, F>,
  fetcher: &F,
  request: Request,
  json: bool,
) -> Result<()>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  match worker.register().await? {
    Registration::Installed {
      precached,
      activation,
    } => info!(
      precached,
      purged = activation.purged.len(),
      "Installed worker before first fetch"
    ),
    Registration::Resumed { activation } => debug!(
      purged = activation.purged.len(),
      "Resumed installed worker"
    ),
  }

  let served = match worker.handle_fetch(request.clone()).await? {
    FetchOutcome::Respond(served) => served,
    FetchOutcome::Passthrough => {
      info!(method = %request.method, url = %request.url, "Not intercepted; fetching directly");
      Served::from_network(fetcher.fetch(&request).await?)
    }
  };

  print_served(&request, &served, json)?;

  let pending = worker.pending_background();
  if pending > 0 {
    info!(count = pending, "Waiting for background cache work");
  }
  worker.settle().await;
  Ok(())
}

/// One row per cache: `keep` or `stale`, entry count, name.
async fn caches<S, W>(storage: &S, worker_config: &WorkerConfig, out: &mut W) -> Result<()>
where
  S: CacheStorage + ?Sized,
  W: Write,
{
  let names = storage.cache_names().await?;
  if names.is_empty() {
    writeln!(out, "No caches")?;
    return Ok(());
  }

  for name in names {
    let count = storage.len(&name).await?;
    let marker = if worker_config.keeps(&name) {
      "keep"
    } else {
      "stale"
    };
    writeln!(out, "{:<6} {:>6}  {}", marker, count, name)?;
  }
  Ok(())
}

fn build_request(
  config: &Config,
  target: &str,
  navigate: bool,
  image: bool,
  method: &str,
) -> Result<Request> {
  let url = config.resolve(target)?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let request = if navigate {
    Request::navigate(url)
  } else if image {
    Request::image(url)
  } else {
    Request::get(url)
  };
  Ok(request.with_method(method))
}

#[derive(Serialize)]
struct FetchSummary<'a> {
  url: &'a str,
  status: u16,
  source: ResponseSource,
  cached_at: Option<DateTime<Utc>>,
  content_type: Option<&'a str>,
  headers: &'a [(String, String)],
  bytes: usize,
}

fn print_served(request: &Request, served: &Served, json: bool) -> Result<()> {
  let response = &served.response;

  if json {
    let summary = FetchSummary {
      url: request.url.as_str(),
      status: response.status,
      source: served.source,
      cached_at: served.cached_at,
      content_type: response.header("content-type"),
      headers: &response.headers,
      bytes: response.body.len(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    return Ok(());
  }

  eprintln!("{} {} ({:?})", response.status, request.url, served.source);
  for (name, value) in &response.headers {
    eprintln!("{}: {}", name, value);
  }
  std::io::stdout()
    .write_all(&response.body)
    .map_err(|e| eyre!("Failed to write response body: {}", e))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{RequestDestination, RequestKey, RequestMode, Response};

  #[test]
  fn test_build_request() {
    let config = Config::with_origin("https://shop.test/");

    let request = build_request(&config, "./", true, false, "get").unwrap();
    assert_eq!(request.mode, RequestMode::Navigate);
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.url.as_str(), "https://shop.test/");

    let request = build_request(&config, "menu/taro.jpg", false, true, "GET").unwrap();
    assert_eq!(request.destination, RequestDestination::Image);

    let request = build_request(&config, "api/orders", false, false, "post").unwrap();
    assert_eq!(request.method, Method::POST);

    assert!(build_request(&config, "./", false, false, "BAD METHOD").is_err());
  }

  #[tokio::test]
  async fn test_caches_marks_stale_generations() {
    let storage = MemoryStorage::new();
    storage.open("tapioca-v0-9-0").await.unwrap();
    let image = RequestKey::get(&url::Url::parse("https://shop.test/hero.png").unwrap());
    storage
      .put("tapioca-images-v1", &image, &Response::new(200).with_body("png"))
      .await
      .unwrap();
    let config = Config::with_origin("https://shop.test/").worker_config().unwrap();

    let mut out = Vec::new();
    caches(&storage, &config, &mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();
    let rows: Vec<Vec<&str>> = out.lines().map(|l| l.split_whitespace().collect()).collect();
    assert_eq!(
      rows,
      vec![
        vec!["stale", "0", "tapioca-v0-9-0"],
        vec!["keep", "1", "tapioca-images-v1"],
      ]
    );
  }

  #[tokio::test]
  async fn test_caches_on_empty_store() {
    let config = Config::with_origin("https://shop.test/").worker_config().unwrap();
    let mut out = Vec::new();
    caches(&MemoryStorage::new(), &config, &mut out).await.unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "No caches\n");
  }
}
