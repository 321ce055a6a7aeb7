//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::network::Fetcher;

pub fn origin() -> Url {
  Url::parse("http://localhost:8000/").unwrap()
}

/// Scripted network: fixed answers per path, switchable offline, records every call.
/// Unknown paths answer 404.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, (u16, String)>>,
  unreachable: Mutex<HashSet<String>>,
  offline: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, path: &str, status: u16, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), (status, body.to_string()));
  }

  /// Make a single path fail with a network error.
  pub fn unreachable(&self, path: &str) {
    self.unreachable.lock().unwrap().insert(path.to_string());
  }

  pub fn restore(&self, path: &str) {
    self.unreachable.lock().unwrap().remove(path);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.url().path().to_string();
    self.calls.lock().unwrap().push(path.clone());

    // Yield once so concurrent requests really interleave.
    tokio::task::yield_now().await;

    if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&path) {
      return Err(Error::Network(format!("{} unreachable", request.url())));
    }

    let route = self.routes.lock().unwrap().get(&path).cloned();
    Ok(match route {
      Some((status, body)) => Response::new(status, body),
      None => Response::new(404, "Not Found"),
    })
  }
}
