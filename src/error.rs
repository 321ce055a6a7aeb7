//! Error types for the taskshell worker.

use thiserror::Error;

/// Errors produced by the cache store, the network layer and the worker lifecycle.
#[derive(Error, Debug)]
pub enum Error {
  /// The network could not produce a response (unreachable host, DNS, reset, ...).
  ///
  /// This is the only error the routing strategies recover from.
  #[error("network request failed: {0}")]
  Network(String),

  /// A response body was read before it could be cloned or stored.
  #[error("response body already used")]
  BodyUsed,

  /// Cache storage failure (quota, corruption, I/O).
  #[error("cache storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// A storage mutex was poisoned by a panicking writer.
  #[error("lock poisoned: {0}")]
  LockPoisoned(String),

  /// Filesystem failure while preparing cache storage.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// Stored metadata could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serde(#[from] serde_json::Error),

  /// One or more shell assets could not be fetched during install.
  #[error("install of {partition} failed: {} of {total} shell assets unavailable ({})", .failed.len(), .failed.join(", "))]
  Install {
    partition: String,
    total: usize,
    failed: Vec<String>,
  },

  /// An event arrived in a lifecycle state that cannot handle it.
  #[error("cannot handle {event} while {state}")]
  InvalidTransition {
    event: &'static str,
    state: &'static str,
  },

  /// A request path could not be resolved against the origin.
  #[error("invalid request url: {0}")]
  Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    Error::Network(err.to_string())
  }
}

/// A specialized `Result` type for taskshell operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Whether the error came from the network and may be recovered locally.
  pub fn is_network(&self) -> bool {
    matches!(self, Error::Network(_))
  }
}
