//! The upstream network, behind a trait so strategies can run against a fake.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{fetch_error, FetchError};
use crate::http::{Request, Response};

/// Performs live fetches against the origin.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Fetch a request from the network.
  ///
  /// Any HTTP status is a successful fetch; only transport failures are errors.
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  /// Create a fetcher, optionally bounding every request by `timeout`.
  pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| FetchError::Client(e.to_string()))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.as_str();
    debug!(method = %request.method, url, "Fetching from network");

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(fetch_error(url))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(fetch_error(url))?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
