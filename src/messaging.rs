//! Control-plane envelopes exchanged with the running application.
//!
//! Both directions use the same `{type, payload}` JSON layout:
//!
//! ```json
//! {"type": "PRECACHE_URLS", "payload": ["/a.js", "/b.css"]}
//! {"type": "REPLAY_SUCCESS", "payload": {"id": "4f1c..."}}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Messages the application sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate the waiting version now instead of waiting
  VersionReady,
  /// Cache an explicit list of URLs
  PrecacheUrls(Vec<String>),
}

/// Messages the relay broadcasts to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
  /// A queued action was replayed successfully
  ReplaySuccess { id: String },
  /// A new version finished installing and waits for `VERSION_READY`
  VersionWaiting { version: String },
  /// A version took over interception
  VersionActivated { version: String },
}

/// Broadcast channel to every connected client.
#[derive(Clone)]
pub struct MessageChannel {
  tx: broadcast::Sender<RelayMessage>,
}

impl MessageChannel {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RelayMessage> {
    self.tx.subscribe()
  }

  /// Send to all current subscribers. Having none is not an error.
  pub fn publish(&self, message: RelayMessage) {
    match self.tx.send(message) {
      Ok(receivers) => debug!(receivers, "published client message"),
      Err(broadcast::error::SendError(message)) => {
        debug!(?message, "no clients connected, message dropped")
      }
    }
  }
}

impl Default for MessageChannel {
  fn default() -> Self {
    Self::new(64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_client_envelopes() {
    let ready: ClientMessage = serde_json::from_value(json!({"type": "VERSION_READY"})).unwrap();
    assert_eq!(ready, ClientMessage::VersionReady);

    let precache: ClientMessage =
      serde_json::from_value(json!({"type": "PRECACHE_URLS", "payload": ["/a.js"]})).unwrap();
    assert_eq!(precache, ClientMessage::PrecacheUrls(vec!["/a.js".to_string()]));

    assert!(serde_json::from_value::<ClientMessage>(json!({"type": "SHUTDOWN"})).is_err());
  }

  #[test]
  fn test_relay_envelope_layout() {
    let value = serde_json::to_value(RelayMessage::ReplaySuccess {
      id: "abc".to_string(),
    })
    .unwrap();
    assert_eq!(value, json!({"type": "REPLAY_SUCCESS", "payload": {"id": "abc"}}));
  }

  #[tokio::test]
  async fn test_publish_reaches_subscribers() {
    let channel = MessageChannel::default();
    // No subscribers yet: dropped quietly
    channel.publish(RelayMessage::VersionActivated {
      version: "v0".to_string(),
    });

    let mut rx = channel.subscribe();
    channel.publish(RelayMessage::VersionActivated {
      version: "v1".to_string(),
    });
    assert_eq!(
      rx.recv().await.unwrap(),
      RelayMessage::VersionActivated {
        version: "v1".to_string()
      }
    );
  }
}
