//! Request and response types passed through the worker.
//!
//! Response bodies are single-consumption: once read, the body is gone. Storing a
//! response while also handing it to the page therefore needs an explicit
//! [`Response::try_clone`] first, and the cache refuses bodies that were already used.

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

/// Ordered, case-insensitive header list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Look up the first value for a header name.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace every value of `name` with `value`.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
    self.0.push((name, value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// An outgoing request made by the page.
#[derive(Debug, Clone)]
pub struct Request {
  method: Method,
  url: Url,
  headers: Headers,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a GET request for a path relative to `origin` (e.g. `/styles.css`).
  pub fn get_path(origin: &Url, path: &str) -> Result<Self> {
    Ok(Self::get(origin.join(path)?))
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  /// Normalized cache key: method + URL without fragment. Headers never take part.
  pub fn key(&self) -> RequestKey {
    let mut url = self.url.clone();
    url.set_fragment(None);
    RequestKey(format!("{} {}", self.method.as_str(), url))
  }
}

/// Normalized identity of a request inside a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 of the key, for stable fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// A single-consumption response body.
#[derive(Debug, Default)]
pub struct Body {
  bytes: Option<Bytes>,
}

impl Body {
  pub fn new(bytes: impl Into<Bytes>) -> Self {
    Self {
      bytes: Some(bytes.into()),
    }
  }

  pub fn is_used(&self) -> bool {
    self.bytes.is_none()
  }

  fn peek(&self) -> Result<&Bytes> {
    self.bytes.as_ref().ok_or(Error::BodyUsed)
  }

  fn take(&mut self) -> Result<Bytes> {
    self.bytes.take().ok_or(Error::BodyUsed)
  }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Served from cache because the network was unreachable
  Offline,
  /// Synthesized by the worker (503 page or default task list)
  Fallback,
}

impl ResponseSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Fallback => "fallback",
    }
  }
}

/// A response flowing back to the page.
///
/// Deliberately not `Clone`: duplication goes through [`Response::try_clone`], which
/// fails once the body has been read.
#[derive(Debug)]
pub struct Response {
  status: u16,
  status_text: String,
  headers: Headers,
  body: Body,
  source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    let status_text = StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();

    Self {
      status,
      status_text,
      headers: Headers::new(),
      body: Body::new(body),
      source: ResponseSource::Network,
    }
  }

  pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
    self.status_text = text.into();
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn status_text(&self) -> &str {
    &self.status_text
  }

  /// Status in the 200-299 range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  pub fn source(&self) -> ResponseSource {
    self.source
  }

  pub fn body_used(&self) -> bool {
    self.body.is_used()
  }

  /// Duplicate the response, body included. Fails if the body was already read.
  pub fn try_clone(&self) -> Result<Self> {
    Ok(Self {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: Body::new(self.body.peek()?.clone()),
      source: self.source,
    })
  }

  /// Read the body, leaving this response marked as used.
  pub fn take_bytes(&mut self) -> Result<Bytes> {
    self.body.take()
  }

  pub fn bytes(mut self) -> Result<Bytes> {
    self.take_bytes()
  }

  pub fn text(self) -> Result<String> {
    let bytes = self.bytes()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }

  pub fn json<T: DeserializeOwned>(self) -> Result<T> {
    let bytes = self.bytes()?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Turn an unread response into a replayable snapshot for storage.
  pub fn into_stored(mut self) -> Result<StoredResponse> {
    let body = self.body.take()?;
    Ok(StoredResponse {
      status: self.status,
      status_text: self.status_text,
      headers: self.headers,
      body,
    })
  }

  /// Rebuild a fresh response from a stored snapshot.
  pub fn from_stored(stored: StoredResponse, source: ResponseSource) -> Self {
    Self {
      status: stored.status,
      status_text: stored.status_text,
      headers: stored.headers,
      body: Body::new(stored.body),
      source,
    }
  }
}

/// An immutable, replayable copy of a response as held by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Bytes,
}
