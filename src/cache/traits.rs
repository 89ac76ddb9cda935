//! Core traits and types for the partition store.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{Request, RequestKey, StoredResponse};

/// A stored response keyed by canonical request identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  /// Original URL, kept for status output and debugging
  pub url: String,
  pub response: StoredResponse,
  pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(request: &Request, response: StoredResponse) -> Self {
    Self {
      key: request.key(),
      url: request.url.to_string(),
      response,
      inserted_at: Utc::now(),
    }
  }
}

/// Keyed storage for named partitions.
///
/// Each call is atomic; concurrent writers to the same key resolve as
/// last-write-wins. Partitions are created implicitly by the first `put`.
pub trait PartitionStore: Send + Sync {
  /// Look up an entry.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Insert or replace an entry. A replaced entry moves to the newest
  /// insertion position.
  fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()>;

  /// Number of entries in a partition (zero if it does not exist).
  fn count(&self, partition: &str) -> Result<usize>;

  /// Entry keys, oldest insertion first.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// Remove the `n` oldest entries. Returns how many were removed.
  fn evict_oldest(&self, partition: &str, n: usize) -> Result<usize>;

  /// Names of all existing partitions, oldest first.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and everything in it. Returns false if absent.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Version last activated, if any.
  fn active_version(&self) -> Result<Option<String>>;

  /// Record `version` as the activated one.
  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// Response handed back to the caller, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: StoredResponse,
  pub source: CacheSource,
  /// When the entry was stored (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Cache,
      cached_at: Some(entry.inserted_at),
    }
  }

  /// Stored entry served because the network attempt failed.
  pub fn offline(entry: CacheEntry) -> Self {
    Self {
      source: CacheSource::Offline,
      ..Self::from_cache(entry)
    }
  }

  /// Synthesized stand-in (placeholder image, offline page, offline JSON).
  pub fn fallback(response: StoredResponse) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }

  pub fn queued(response: StoredResponse) -> Self {
    Self {
      response,
      source: CacheSource::Queued,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// Stored entry, network not consulted first
  Cache,
  /// Stored entry served because the network failed
  Offline,
  /// Placeholder or synthesized response
  Fallback,
  /// Mutating request recorded for later replay
  Queued,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Fallback => "fallback",
      Self::Queued => "queued",
    }
  }
}
