//! SQLite implementation of the partition store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::traits::{CacheEntry, PartitionStore};
use crate::db::Database;
use crate::http::{RequestKey, StoredResponse};

/// SQLite-based partition storage.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl PartitionStore for SqliteStorage {
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, inserted_at FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, key.as_str()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((url, status, headers, body, inserted_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

    Ok(Some(CacheEntry {
      key: key.clone(),
      url,
      response: StoredResponse {
        status,
        headers,
        body,
      },
      inserted_at: parse_datetime(&inserted_at)?,
    }))
  }

  fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()> {
    let mut conn = self.db.lock()?;
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Partitions come into existence on first write
    tx.execute(
      "INSERT OR IGNORE INTO partitions (name, created_seq)
       SELECT ?, COALESCE(MAX(created_seq), 0) + 1 FROM partitions",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, request_key, url, status, headers, body, inserted_at, seq)
       SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(MAX(seq), 0) + 1
       FROM cache_entries WHERE partition = ?1",
      params![
        partition,
        entry.key.as_str(),
        entry.url,
        entry.response.status,
        headers,
        entry.response.body,
        entry.inserted_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM cache_entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read keys: {}", e))?;

    Ok(keys.into_iter().map(RequestKey::from_stored).collect())
  }

  fn evict_oldest(&self, partition: &str, n: usize) -> Result<usize> {
    if n == 0 {
      return Ok(0);
    }

    let conn = self.db.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?1 AND request_key IN (
           SELECT request_key FROM cache_entries WHERE partition = ?1
           ORDER BY seq LIMIT ?2
         )",
        params![partition, n as i64],
      )
      .map_err(|e| eyre!("Failed to evict from {}: {}", partition, e))?;

    Ok(removed)
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY created_seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partitions: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn active_version(&self) -> Result<Option<String>> {
    let conn = self.db.lock()?;
    conn
      .query_row("SELECT version FROM active_version WHERE id = 1", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO active_version (id, version, activated_at) VALUES (1, ?, ?)",
        params![version, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to record active version {}: {}", version, e))?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp as written by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Request;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::in_memory().unwrap())
  }

  fn entry(path: &str, body: &str) -> CacheEntry {
    let url = Url::parse("http://app.test").unwrap().join(path).unwrap();
    let response = StoredResponse::new(200, body).with_header("content-type", "text/plain");
    CacheEntry::new(&Request::get(url), response)
  }

  #[test]
  fn test_put_and_get() {
    let store = storage();
    let e = entry("/a", "hello");
    store.put("static-v1", &e).unwrap();

    let got = store.get("static-v1", &e.key).unwrap().unwrap();
    assert_eq!(got.response, e.response);
    assert_eq!(got.url, "http://app.test/a");
    assert_eq!(got.inserted_at.timestamp_millis(), e.inserted_at.timestamp_millis());

    assert!(store.get("image-v1", &e.key).unwrap().is_none());
  }

  #[test]
  fn test_partition_created_lazily() {
    let store = storage();
    assert!(store.partitions().unwrap().is_empty());
    assert_eq!(store.count("dynamic-v1").unwrap(), 0);

    store.put("dynamic-v1", &entry("/x", "1")).unwrap();
    store.put("api-v1", &entry("/y", "2")).unwrap();
    store.put("dynamic-v1", &entry("/z", "3")).unwrap();

    assert_eq!(store.partitions().unwrap(), vec!["dynamic-v1", "api-v1"]);
    assert_eq!(store.count("dynamic-v1").unwrap(), 2);
  }

  #[test]
  fn test_insertion_order_and_eviction() {
    let store = storage();
    let (a, b, c) = (entry("/a", "a"), entry("/b", "b"), entry("/c", "c"));
    for e in [&a, &b, &c] {
      store.put("image-v1", e).unwrap();
    }
    assert_eq!(
      store.keys("image-v1").unwrap(),
      vec![a.key.clone(), b.key.clone(), c.key.clone()]
    );

    assert_eq!(store.evict_oldest("image-v1", 1).unwrap(), 1);
    assert_eq!(store.keys("image-v1").unwrap(), vec![b.key, c.key]);
    assert_eq!(store.evict_oldest("image-v1", 0).unwrap(), 0);
  }

  #[test]
  fn test_replace_moves_to_newest() {
    let store = storage();
    let (a, b) = (entry("/a", "a"), entry("/b", "b"));
    store.put("api-v1", &a).unwrap();
    store.put("api-v1", &b).unwrap();
    store.put("api-v1", &entry("/a", "a2")).unwrap();

    assert_eq!(store.count("api-v1").unwrap(), 2);
    assert_eq!(store.keys("api-v1").unwrap(), vec![b.key, a.key.clone()]);
    let got = store.get("api-v1", &a.key).unwrap().unwrap();
    assert_eq!(got.response.body, b"a2");
  }

  #[test]
  fn test_delete_partition() {
    let store = storage();
    store.put("static-v1", &entry("/a", "a")).unwrap();
    store.put("static-v2", &entry("/a", "a")).unwrap();

    assert!(store.delete_partition("static-v1").unwrap());
    assert!(!store.delete_partition("static-v1").unwrap());
    assert_eq!(store.partitions().unwrap(), vec!["static-v2"]);
    assert_eq!(store.count("static-v1").unwrap(), 0);
  }

  #[test]
  fn test_active_version_record() {
    let store = storage();
    assert_eq!(store.active_version().unwrap(), None);

    store.set_active_version("v1").unwrap();
    store.set_active_version("v2").unwrap();
    assert_eq!(store.active_version().unwrap().as_deref(), Some("v2"));

    // Independent of partition lifetimes
    store.put("static-v2", &entry("/a", "a")).unwrap();
    store.delete_partition("static-v2").unwrap();
    assert_eq!(store.active_version().unwrap().as_deref(), Some("v2"));
  }
}
