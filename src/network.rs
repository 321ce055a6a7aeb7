//! Network access for the worker.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::http::{Headers, Request, Response, ResponseSource};

/// Anything that can turn a request into a network response.
///
/// `Err(Error::Network)` means no response was obtained at all; HTTP error statuses are
/// still `Ok` responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Fetcher backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  /// No request timeout is set: a hung fetch hangs its request.
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("taskshell/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method().clone(), request.url().clone());
    for (name, value) in request.headers().iter() {
      builder = builder.header(name, value);
    }

    let response = builder.send().await?;
    let status = response.status();

    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.insert(name.as_str(), value);
      }
    }

    // Only a fully read body counts as a response.
    let body = response.bytes().await?;
    debug!(url = %request.url(), status = status.as_u16(), bytes = body.len(), "Network response");

    Ok(
      Response::new(status.as_u16(), body)
        .with_status_text(status.canonical_reason().unwrap_or_default())
        .with_headers(headers)
        .with_source(ResponseSource::Network),
    )
  }
}
