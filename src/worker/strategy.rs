//! Request classification and the two caching strategies.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::http::{Request, Response, ResponseSource};
use crate::network::Fetcher;
use crate::tasks::FallbackPayload;

/// Body of the synthesized response for shell assets that cannot be reached.
pub const OFFLINE_BODY: &str = "Offline - the resource could not be loaded";

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Shell assets: cache, then network, then a 503 page
  CacheFirst,
  /// The data endpoint: network, then cache, then the default task list
  NetworkFirst,
}

/// Executes a strategy per request against the shared cache store.
///
/// Partition names and the fallback payload are fixed at construction, so several
/// engines for different versions can share one store.
#[derive(Clone)]
pub struct StrategyEngine {
  config: Arc<WorkerConfig>,
  shell: String,
  data: String,
  fallback: FallbackPayload,
  store: CacheStore,
  fetcher: Arc<dyn Fetcher>,
}

impl StrategyEngine {
  pub fn new(
    config: Arc<WorkerConfig>,
    fallback: FallbackPayload,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
  ) -> Self {
    Self {
      shell: config.shell_partition(),
      data: config.data_partition(),
      config,
      fallback,
      store,
      fetcher,
    }
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    if self.config.is_data_request(request.url()) {
      Strategy::NetworkFirst
    } else {
      Strategy::CacheFirst
    }
  }

  /// Answer a request. Only cache storage failures surface as errors.
  pub async fn handle(&self, request: &Request) -> Result<Response> {
    let strategy = self.classify(request);
    debug!(method = %request.method(), url = %request.url(), ?strategy, "Routing request");

    match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Response> {
    if let Some(cached) = self.store.partition(&self.shell).match_request(request)? {
      debug!(url = %request.url(), "Serving from cache");
      return Ok(cached);
    }

    debug!(url = %request.url(), "Cache miss, fetching from network");
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_copy(&self.shell, request, &response)?;
        Ok(response)
      }
      Err(e) if e.is_network() => {
        warn!(url = %request.url(), error = %e, "Shell asset unavailable");
        Ok(offline_response())
      }
      Err(e) => Err(e),
    }
  }

  async fn network_first(&self, request: &Request) -> Result<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_copy(&self.data, request, &response)?;
        Ok(response)
      }
      Err(e) if e.is_network() => {
        debug!(url = %request.url(), error = %e, "Network unavailable, trying cache");
        if let Some(cached) = self.store.partition(&self.data).match_request(request)? {
          debug!(url = %request.url(), "Serving data from cache (offline)");
          return Ok(cached.with_source(ResponseSource::Offline));
        }

        warn!(url = %request.url(), "No cached data, serving default tasks");
        Ok(self.fallback_response())
      }
      Err(e) => Err(e),
    }
  }

  /// Straight network access for requests the worker does not control yet.
  pub async fn passthrough(&self, request: &Request) -> Result<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => Ok(response),
      Err(e) if e.is_network() => {
        warn!(url = %request.url(), error = %e, "Network unavailable");
        Ok(offline_response())
      }
      Err(e) => Err(e),
    }
  }

  /// Keep an independent copy of a complete 200 GET response.
  fn store_copy(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    if response.status() != 200 || *request.method() != reqwest::Method::GET {
      debug!(url = %request.url(), status = response.status(), "Response not cached");
      return Ok(());
    }

    self.store.open(partition)?.put(request, response.try_clone()?)?;
    debug!(partition, url = %request.url(), "Stored response");
    Ok(())
  }

  fn fallback_response(&self) -> Response {
    Response::new(200, self.fallback.body())
      .with_header("Content-Type", "application/json")
      .with_source(ResponseSource::Fallback)
  }
}

/// The 503 answer for shell assets that are neither cached nor reachable.
pub fn offline_response() -> Response {
  Response::new(503, OFFLINE_BODY)
    .with_status_text("Service Unavailable")
    .with_header("Content-Type", "text/plain")
    .with_source(ResponseSource::Fallback)
}
