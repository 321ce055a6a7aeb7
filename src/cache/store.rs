//! Partitioned request→response store used by the routing strategies.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::storage::{CacheStorage, CachedEntry};
use crate::error::Result;
use crate::http::{Request, Response, ResponseSource};

/// Cache store shared by every in-flight request.
///
/// Thin wrapper over a [`CacheStorage`] backend that speaks in requests and responses
/// instead of keys and snapshots.
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
}

impl CacheStore {
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn from_shared(storage: Arc<dyn CacheStorage>) -> Self {
    Self { storage }
  }

  /// Open a partition, creating it if absent.
  pub fn open(&self, name: &str) -> Result<Partition> {
    self.storage.create_partition(name)?;
    Ok(self.partition(name))
  }

  /// Handle to a partition without creating it. Lookups on a missing partition miss.
  pub fn partition(&self, name: &str) -> Partition {
    Partition {
      storage: Arc::clone(&self.storage),
      name: name.to_string(),
    }
  }

  pub fn has(&self, name: &str) -> Result<bool> {
    self.storage.has_partition(name)
  }

  /// Names of every partition currently in storage.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.partition_names()
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_partition(name)
  }

  /// Remove every partition whose name is not in `active`. Returns the removed names.
  pub fn delete_partitions_not_in(&self, active: &BTreeSet<String>) -> Result<Vec<String>> {
    let mut retired = Vec::new();
    for name in self.keys()? {
      if active.contains(&name) {
        continue;
      }
      if self.delete(&name)? {
        info!(partition = %name, "Deleted outdated cache partition");
        retired.push(name);
      }
    }
    Ok(retired)
  }
}

/// A named partition of the cache store.
#[derive(Clone)]
pub struct Partition {
  storage: Arc<dyn CacheStorage>,
  name: String,
}

impl Partition {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up a request. A miss is `Ok(None)`.
  pub fn match_request(&self, request: &Request) -> Result<Option<Response>> {
    let key = request.key();
    let found = self.storage.get(&self.name, &key)?;
    debug!(partition = %self.name, %key, hit = found.is_some(), "Cache lookup");
    Ok(found.map(|stored| Response::from_stored(stored, ResponseSource::Cache)))
  }

  /// Store a response for a request, replacing any previous entry.
  ///
  /// The response must be an unread copy; pass the result of [`Response::try_clone`]
  /// when the original still has to reach the page.
  pub fn put(&self, request: &Request, response: Response) -> Result<()> {
    let stored = response.into_stored()?;
    self.storage.put(&self.name, &request.key(), &stored)
  }

  /// Store every pair or none of them.
  pub fn put_all(&self, pairs: Vec<(Request, Response)>) -> Result<()> {
    let entries = pairs
      .into_iter()
      .map(|(request, response)| -> Result<_> { Ok((request.key(), response.into_stored()?)) })
      .collect::<Result<Vec<_>>>()?;
    self.storage.put_all(&self.name, &entries)
  }

  pub fn entries(&self) -> Result<Vec<CachedEntry>> {
    self.storage.entries(&self.name)
  }
}
