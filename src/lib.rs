//! Offline caching worker for a small task-list web app.
//!
//! Shell assets are answered cache-first, the `data.json` endpoint network-first, and
//! when neither network nor cache can answer the worker synthesizes a response: a 503
//! page for assets, a default task list for data.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod loader;
pub mod network;
#[cfg(feature = "server")]
pub mod server;
pub mod tasks;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
