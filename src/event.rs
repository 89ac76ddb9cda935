use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::http::Request;
use crate::messaging::ClientMessage;
use crate::network::Network;

/// Everything the relay reacts to.
#[derive(Debug)]
pub enum RelayEvent {
  /// Install (and, if nothing is active, activate) a version
  Install { version: String },
  /// Activate the waiting version
  Activate,
  /// An intercepted request
  Fetch(Request),
  /// The host regained connectivity
  ConnectivityRestored,
  /// Control message from the application
  Message(ClientMessage),
}

/// Watches the origin and emits `ConnectivityRestored` on every
/// offline -> online transition.
pub struct ConnectivityMonitor {
  rx: mpsc::UnboundedReceiver<RelayEvent>,
}

impl ConnectivityMonitor {
  /// Start probing `probe_url` every `interval`.
  pub fn new(network: Arc<dyn Network>, probe_url: Url, interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      let probe = Request::new(reqwest::Method::HEAD, probe_url);
      let mut online = true;

      loop {
        ticker.tick().await;
        let reachable = network.send(&probe).await.is_ok();

        match (online, reachable) {
          (false, true) => {
            info!("connectivity restored");
            if tx.send(RelayEvent::ConnectivityRestored).is_err() {
              break;
            }
          }
          (true, false) => info!("origin unreachable, offline"),
          _ => debug!(reachable, "probe"),
        }
        online = reachable;
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<RelayEvent> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{url, FakeNetwork};

  #[tokio::test]
  async fn test_emits_on_reconnect_only() {
    let network = FakeNetwork::new();
    network.respond("/", 200, "ok");
    network.set_offline(true);

    let mut monitor =
      ConnectivityMonitor::new(network.clone(), url("/"), Duration::from_millis(20));

    // Offline for a few probes, nothing emitted
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(monitor.rx.try_recv().is_err());

    network.set_offline(false);
    let event = tokio::time::timeout(Duration::from_secs(1), monitor.next())
      .await
      .unwrap();
    assert!(matches!(event, Some(RelayEvent::ConnectivityRestored)));

    // Staying online does not emit again
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(monitor.rx.try_recv().is_err());
  }
}
