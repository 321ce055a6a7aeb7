//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::http::{Headers, RequestKey, StoredResponse};

/// Summary of a stored entry, for listings.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Normalized request key ("GET http://...")
  pub key: String,
  pub status: u16,
  /// Body size in bytes
  pub size: usize,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Each call is atomic with respect to its partition and key. Partitions are created
/// lazily by `create_partition`, `put` and `put_all`.
pub trait CacheStorage: Send + Sync {
  /// Create a partition if it does not exist yet.
  fn create_partition(&self, name: &str) -> Result<()>;

  fn has_partition(&self, name: &str) -> Result<bool>;

  /// All partition names, oldest first.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Drop a partition with every entry in it. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Insert or overwrite a single entry.
  fn put(&self, partition: &str, key: &RequestKey, response: &StoredResponse) -> Result<()>;

  /// Write every entry or none of them.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()>;

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>>;
}

/// Storage kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<MemoryPartitions>,
}

type MemoryEntries = BTreeMap<RequestKey, (StoredResponse, DateTime<Utc>)>;

/// Partitions in creation order.
#[derive(Default)]
struct MemoryPartitions(Vec<(String, MemoryEntries)>);

impl MemoryPartitions {
  fn get(&self, name: &str) -> Option<&MemoryEntries> {
    self.0.iter().find(|(n, _)| n == name).map(|(_, entries)| entries)
  }

  fn get_or_create(&mut self, name: &str) -> &mut MemoryEntries {
    let index = match self.0.iter().position(|(n, _)| n == name) {
      Some(index) => index,
      None => {
        self.0.push((name.to_string(), BTreeMap::new()));
        self.0.len() - 1
      }
    };
    &mut self.0[index].1
  }

  fn remove(&mut self, name: &str) -> bool {
    let before = self.0.len();
    self.0.retain(|(n, _)| n != name);
    self.0.len() != before
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, MemoryPartitions>> {
    self
      .partitions
      .lock()
      .map_err(|e| Error::LockPoisoned(e.to_string()))
  }
}

impl CacheStorage for MemoryStorage {
  fn create_partition(&self, name: &str) -> Result<()> {
    self.lock()?.get_or_create(name);
    Ok(())
  }

  fn has_partition(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.get(name).is_some())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.0.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.remove(name))
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .lock()?
        .get(partition)
        .and_then(|entries| entries.get(key))
        .map(|(response, _)| response.clone()),
    )
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    self
      .lock()?
      .get_or_create(partition)
      .insert(key.clone(), (response.clone(), Utc::now()));
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let mut partitions = self.lock()?;
    let target = partitions.get_or_create(partition);
    let now = Utc::now();
    for (key, response) in entries {
      target.insert(key.clone(), (response.clone(), now));
    }
    Ok(())
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let partitions = self.lock()?;
    let Some(entries) = partitions.get(partition) else {
      return Ok(Vec::new());
    };

    Ok(
      entries
        .iter()
        .map(|(key, (response, stored_at))| CachedEntry {
          key: key.to_string(),
          status: response.status,
          size: response.body.len(),
          stored_at: *stored_at,
        })
        .collect(),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named, versioned partitions
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, one row per normalized request
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_partition ON entries(partition);
"#;

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    Self::with_connection(Connection::open(path)?)
  }

  /// A private database that disappears with the process.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::LockPoisoned(e.to_string()))
  }
}

fn insert_entry(
  conn: &Connection,
  partition: &str,
  key: &RequestKey,
  response: &StoredResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO entries
       (partition, key_hash, request_key, status, status_text, headers, body, stored_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      partition,
      key.cache_hash(),
      key.as_str(),
      response.status,
      response.status_text,
      headers,
      &response.body[..],
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn create_partition(&self, name: &str) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![name],
    )?;
    Ok(())
  }

  fn has_partition(&self, name: &str) -> Result<bool> {
    let found: Option<i64> = self
      .lock()?
      .query_row(
        "SELECT 1 FROM partitions WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])?;
    let removed = tx.execute("DELETE FROM partitions WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, status_text, headers, body FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, status_text, headers, body)) => {
        let headers: Headers = serde_json::from_str(&headers)?;
        Ok(Some(StoredResponse {
          status,
          status_text,
          headers,
          body: body.into(),
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )?;
    insert_entry(&tx, partition, key, response)?;
    tx.commit()?;
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )?;
    for (key, response) in entries {
      insert_entry(&tx, partition, key, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT request_key, status, length(body), stored_at FROM entries
       WHERE partition = ? ORDER BY request_key",
    )?;

    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, String>(3)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(
      rows
        .into_iter()
        .map(|(key, status, size, stored_at)| CachedEntry {
          key,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          stored_at: parse_datetime(&stored_at),
        })
        .collect(),
    )
  }
}

/// Parse a datetime string from SQLite format ("YYYY-MM-DD HH:MM:SS").
fn parse_datetime(s: &str) -> DateTime<Utc> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .unwrap_or_default()
}
