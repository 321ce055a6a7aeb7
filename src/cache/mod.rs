//! Partitioned cache store for intercepted requests.
//!
//! This module provides the storage side of the worker:
//! - Named, versioned partitions holding request→response snapshots
//! - Lookup by normalized request (method + URL), never by headers
//! - Whole-partition invalidation only; entries carry no TTL

mod storage;
mod store;

pub use storage::{CacheStorage, CachedEntry, MemoryStorage, SqliteStorage};
pub use store::{CacheStore, Partition};
