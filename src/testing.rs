//! Test doubles shared by unit tests.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::cache::{PartitionLimits, SqliteStorage};
use crate::classify::default_rules;
use crate::db::Database;
use crate::error::NetworkError;
use crate::http::{Request, StoredResponse};
use crate::network::Network;
use crate::outbox::SqliteActionStore;
use crate::relay::{Relay, RelayOptions};

pub const ORIGIN: &str = "http://app.test";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn memory_store() -> Arc<SqliteStorage> {
  Arc::new(SqliteStorage::new(Database::in_memory().unwrap()))
}

/// A relay over one in-memory database, precaching `/` and the offline page.
pub fn relay(limits: PartitionLimits) -> (Arc<FakeNetwork>, Arc<SqliteStorage>, Relay) {
  let db = Database::in_memory().unwrap();
  let network = FakeNetwork::new();
  let store = Arc::new(SqliteStorage::new(db.clone()));
  let actions = Arc::new(SqliteActionStore::new(db));
  let options = RelayOptions {
    origin: Url::parse(ORIGIN).unwrap(),
    rules: default_rules(),
    limits,
    precache: vec!["/".to_string(), "/offline.html".to_string()],
    offline_page: "/offline.html".to_string(),
  };
  let relay = Relay::new(options, store.clone(), actions, network.clone()).unwrap();
  (network, store, relay)
}

/// Scriptable in-process network.
///
/// Unknown URLs answer 404. Offline mode or a per-URL failure makes `send`
/// return `NetworkError::Unreachable`.
#[derive(Default)]
pub struct FakeNetwork {
  responses: Mutex<HashMap<String, StoredResponse>>,
  failing: Mutex<HashSet<String>>,
  calls: Mutex<Vec<(Method, String)>>,
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) {
    self.respond_with(path, StoredResponse::new(status, body));
  }

  pub fn respond_with(&self, path: &str, response: StoredResponse) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url(path).to_string(), response);
  }

  pub fn fail(&self, path: &str) {
    self.failing.lock().unwrap().insert(url(path).to_string());
  }

  pub fn recover(&self, path: &str) {
    self.failing.lock().unwrap().remove(&url(path).to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    let target = url(path).to_string();
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, u)| *u == target)
      .count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn send(&self, request: &Request) -> Result<StoredResponse, NetworkError> {
    let target = request.url.to_string();
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method.clone(), target.clone()));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&target) {
      return Err(NetworkError::Unreachable(target));
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&target)
        .cloned()
        .unwrap_or_else(|| StoredResponse::new(404, "not found")),
    )
  }
}
