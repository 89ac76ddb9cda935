//! Offline action queue.
//!
//! Mutating requests that could not reach the network are recorded in a
//! durable store and replayed in enqueue order when connectivity returns.
//! An action leaves the queue only when its replay gets a success response.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result as EyreResult};
use reqwest::Method;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::http::Request;
use crate::messaging::{MessageChannel, RelayMessage};
use crate::network::Network;

/// A mutating request waiting for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAction {
  pub id: String,
  pub url: String,
  pub method: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedAction {
  pub fn from_request(request: &Request) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      url: request.url.to_string(),
      method: request.method.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at: Utc::now(),
    }
  }

  /// Rebuild the original request.
  pub fn to_request(&self) -> EyreResult<Request> {
    let url =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid URL in action {}: {}", self.id, e))?;
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method in action {}: {}", self.id, e))?;

    Ok(Request {
      method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
      navigate: false,
    })
  }
}

/// Durable storage for queued actions. Must survive restarts.
pub trait ActionStore: Send + Sync {
  /// All actions, oldest first.
  fn list(&self) -> EyreResult<Vec<QueuedAction>>;

  fn remove(&self, id: &str) -> EyreResult<()>;

  fn append(&self, action: &QueuedAction) -> EyreResult<()>;
}

/// SQLite-backed action store sharing the relay database.
#[derive(Clone)]
pub struct SqliteActionStore {
  db: Database,
}

impl SqliteActionStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl ActionStore for SqliteActionStore {
  fn list(&self) -> EyreResult<Vec<QueuedAction>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, enqueued_at FROM queued_actions ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Vec<u8>>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query actions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read actions: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, enqueued_at)| {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", id, e))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
          .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?
          .with_timezone(&Utc);
        Ok(QueuedAction {
          id,
          url,
          method,
          headers,
          body,
          enqueued_at,
        })
      })
      .collect()
  }

  fn remove(&self, id: &str) -> EyreResult<()> {
    self
      .db
      .lock()?
      .execute("DELETE FROM queued_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove action {}: {}", id, e))?;
    Ok(())
  }

  fn append(&self, action: &QueuedAction) -> EyreResult<()> {
    let headers = serde_json::to_string(&action.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .lock()?
      .execute(
        "INSERT INTO queued_actions (id, url, method, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          action.id,
          action.url,
          action.method,
          headers,
          action.body,
          action.enqueued_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue action {}: {}", action.id, e))?;
    Ok(())
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  /// Ids replayed successfully, in order
  pub replayed: Vec<String>,
  /// Actions still queued
  pub remaining: usize,
}

/// Records failed mutations and replays them.
pub struct OfflineQueue {
  store: Arc<dyn ActionStore>,
  network: Arc<dyn Network>,
  channel: MessageChannel,
  /// Serializes replay passes so an action is never sent twice concurrently
  replaying: Mutex<()>,
}

impl OfflineQueue {
  pub fn new(
    store: Arc<dyn ActionStore>,
    network: Arc<dyn Network>,
    channel: MessageChannel,
  ) -> Self {
    Self {
      store,
      network,
      channel,
      replaying: Mutex::new(()),
    }
  }

  /// Durably record a request for later replay.
  pub fn enqueue(&self, request: &Request) -> Result<QueuedAction> {
    let action = QueuedAction::from_request(request);
    self.store.append(&action)?;
    info!(id = %action.id, method = %action.method, url = %action.url, "queued offline action");
    Ok(action)
  }

  pub fn pending(&self) -> Result<Vec<QueuedAction>> {
    Ok(self.store.list()?)
  }

  /// Replay queued actions strictly in enqueue order.
  ///
  /// The pass stops at the first action that fails, so later actions never
  /// overtake an earlier one. Failed actions stay queued for the next
  /// trigger; there is no retry within a pass.
  pub async fn replay_all(&self) -> Result<ReplayReport> {
    let _pass = self.replaying.lock().await;
    let actions = self.store.list()?;
    let mut report = ReplayReport::default();

    for action in &actions {
      let request = match action.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(id = %action.id, error = %e, "cannot rebuild queued action");
          break;
        }
      };

      match self.network.send(&request).await {
        Ok(response) if response.is_success() => {
          self.store.remove(&action.id)?;
          info!(id = %action.id, url = %action.url, "replayed offline action");
          self.channel.publish(RelayMessage::ReplaySuccess {
            id: action.id.clone(),
          });
          report.replayed.push(action.id.clone());
        }
        Ok(response) => {
          warn!(id = %action.id, status = response.status, "replay rejected, keeping action queued");
          break;
        }
        Err(e) => {
          debug!(id = %action.id, error = %e, "replay failed, keeping action queued");
          break;
        }
      }
    }

    report.remaining = actions.len() - report.replayed.len();
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{url, FakeNetwork};

  fn queue(network: Arc<FakeNetwork>) -> (OfflineQueue, MessageChannel) {
    let store = Arc::new(SqliteActionStore::new(Database::in_memory().unwrap()));
    let channel = MessageChannel::default();
    (OfflineQueue::new(store, network, channel.clone()), channel)
  }

  fn post(path: &str, body: &str) -> Request {
    Request::new(Method::POST, url(path))
      .with_header("content-type", "application/json")
      .with_body(body)
  }

  #[test]
  fn test_store_roundtrip_preserves_order() {
    let store = SqliteActionStore::new(Database::in_memory().unwrap());
    let first = QueuedAction::from_request(&post("/api/a", "1"));
    let second = QueuedAction::from_request(&post("/api/b", "2"));
    store.append(&first).unwrap();
    store.append(&second).unwrap();

    assert_eq!(store.list().unwrap(), vec![first.clone(), second.clone()]);
    store.remove(&first.id).unwrap();
    assert_eq!(store.list().unwrap(), vec![second]);
  }

  #[test]
  fn test_action_rebuilds_request() {
    let request = post("/api/profile", "{\"a\":1}");
    let rebuilt = QueuedAction::from_request(&request).to_request().unwrap();
    assert_eq!(rebuilt.method, Method::POST);
    assert_eq!(rebuilt.url, request.url);
    assert_eq!(rebuilt.headers, request.headers);
    assert_eq!(rebuilt.body, request.body);
  }

  #[tokio::test]
  async fn test_replay_success_dequeues_and_notifies() {
    let network = FakeNetwork::new();
    network.respond("/api/notes", 201, "{}");
    let (queue, channel) = queue(network.clone());
    let mut rx = channel.subscribe();

    let action = queue.enqueue(&post("/api/notes", "hello")).unwrap();
    let report = queue.replay_all().await.unwrap();

    assert_eq!(report.replayed, vec![action.id.clone()]);
    assert_eq!(report.remaining, 0);
    assert!(queue.pending().unwrap().is_empty());
    assert_eq!(
      rx.recv().await.unwrap(),
      RelayMessage::ReplaySuccess { id: action.id }
    );
    assert_eq!(network.calls(), vec![(Method::POST, url("/api/notes").to_string())]);
  }

  #[tokio::test]
  async fn test_failure_keeps_action_and_order() {
    let network = FakeNetwork::new();
    network.respond("/api/a", 200, "{}");
    network.respond("/api/b", 200, "{}");
    network.respond("/api/c", 200, "{}");
    let (queue, _channel) = queue(network.clone());

    let a = queue.enqueue(&post("/api/a", "a")).unwrap();
    let b = queue.enqueue(&post("/api/b", "b")).unwrap();
    let c = queue.enqueue(&post("/api/c", "c")).unwrap();

    network.fail("/api/b");
    let report = queue.replay_all().await.unwrap();
    assert_eq!(report.replayed, vec![a.id.clone()]);
    assert_eq!(report.remaining, 2);
    // c must not overtake b
    assert_eq!(network.call_count("/api/c"), 0);
    let pending: Vec<String> = queue.pending().unwrap().into_iter().map(|a| a.id).collect();
    assert_eq!(pending, vec![b.id.clone(), c.id.clone()]);

    network.recover("/api/b");
    let report = queue.replay_all().await.unwrap();
    assert_eq!(report.replayed, vec![b.id, c.id]);
    assert!(queue.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_rejected_status_is_not_success() {
    let network = FakeNetwork::new();
    network.respond("/api/a", 500, "oops");
    let (queue, _channel) = queue(network);

    queue.enqueue(&post("/api/a", "a")).unwrap();
    let report = queue.replay_all().await.unwrap();
    assert!(report.replayed.is_empty());
    assert_eq!(queue.pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_replay_offline_is_quiet() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let (queue, _channel) = queue(network);

    queue.enqueue(&post("/api/a", "a")).unwrap();
    let report = queue.replay_all().await.unwrap();
    assert_eq!(report, ReplayReport {
      replayed: Vec::new(),
      remaining: 1
    });
  }
}
