//! The relay service: one explicit instance per process, built from injected
//! configuration, partition store, action store and network client.

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  image_placeholder, offline_api_response, stamp_cached_at, CacheEntry, CacheLayer,
  PartitionKind, PartitionLimits, PartitionStore, Served,
};
use crate::classify::{ClassificationRule, Classifier, ResourceClass};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::event::RelayEvent;
use crate::http::{Request, RequestKey, StoredResponse};
use crate::lifecycle::{LifecycleManager, LifecycleSettings, VersionState};
use crate::messaging::{ClientMessage, MessageChannel};
use crate::network::Network;
use crate::outbox::{ActionStore, OfflineQueue, ReplayReport};

/// Construction-time configuration for a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
  pub origin: Url,
  pub rules: Vec<ClassificationRule>,
  pub limits: PartitionLimits,
  pub precache: Vec<String>,
  pub offline_page: String,
}

impl From<&Config> for RelayOptions {
  fn from(config: &Config) -> Self {
    Self {
      origin: config.origin.clone(),
      rules: config.rules.clone(),
      limits: config.partitions.clone(),
      precache: config.precache.clone(),
      offline_page: config.offline_page.clone(),
    }
  }
}

/// Result of dispatching one event.
#[derive(Debug)]
pub enum EventOutcome {
  Response(Served),
  Installed(VersionState),
  Activated(Option<String>),
  Replayed(ReplayReport),
  Handled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
  pub name: String,
  pub entries: usize,
}

/// Snapshot for status output.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
  pub active_version: Option<String>,
  pub waiting_version: Option<String>,
  pub partitions: Vec<PartitionStatus>,
  pub queued_actions: usize,
}

pub struct Relay {
  origin: Url,
  classifier: Classifier,
  layer: CacheLayer,
  lifecycle: LifecycleManager,
  outbox: OfflineQueue,
  channel: MessageChannel,
  store: Arc<dyn PartitionStore>,
  offline_page: RequestKey,
}

impl Relay {
  pub fn new(
    options: RelayOptions,
    store: Arc<dyn PartitionStore>,
    actions: Arc<dyn ActionStore>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let classifier = Classifier::new(&options.rules)?;
    let offline_page = options
      .origin
      .join(&options.offline_page)
      .map(|url| RequestKey::for_url(&url))
      .map_err(|e| RelayError::Config(format!("invalid offline page: {}", e)))?;

    let channel = MessageChannel::default();
    let lifecycle = LifecycleManager::new(
      Arc::clone(&store),
      Arc::clone(&network),
      LifecycleSettings {
        origin: options.origin.clone(),
        precache: options.precache,
        limits: options.limits,
      },
      channel.clone(),
    );
    let outbox = OfflineQueue::new(actions, Arc::clone(&network), channel.clone());
    let layer = CacheLayer::new(Arc::clone(&store), network);

    Ok(Self {
      origin: options.origin,
      classifier,
      layer,
      lifecycle,
      outbox,
      channel,
      store,
      offline_page,
    })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn lifecycle(&self) -> &LifecycleManager {
    &self.lifecycle
  }

  pub fn outbox(&self) -> &OfflineQueue {
    &self.outbox
  }

  pub fn channel(&self) -> &MessageChannel {
    &self.channel
  }

  /// Handle one event.
  pub async fn dispatch(&self, event: RelayEvent) -> Result<EventOutcome> {
    match event {
      RelayEvent::Install { version } => self
        .lifecycle
        .install(&version)
        .await
        .map(EventOutcome::Installed),
      RelayEvent::Activate => self
        .lifecycle
        .skip_waiting()
        .await
        .map(EventOutcome::Activated),
      RelayEvent::Fetch(request) => self.fetch(request).await.map(EventOutcome::Response),
      RelayEvent::ConnectivityRestored => self.outbox.replay_all().await.map(EventOutcome::Replayed),
      RelayEvent::Message(message) => self.on_message(message).await,
    }
  }

  /// Serve an intercepted request.
  pub async fn fetch(&self, request: Request) -> Result<Served> {
    if !request.is_read() {
      return self.forward_mutation(&request).await;
    }

    let class = self.classifier.classify(&request);
    debug!(url = %request.url, ?class, "classified");
    let Some(kind) = PartitionKind::for_class(class) else {
      return self.pass_through(&request).await;
    };

    let claim = match self.lifecycle.claim().await {
      Ok(claim) => claim,
      Err(RelayError::NoActiveVersion) => {
        debug!(url = %request.url, "no active version, forwarding uncached");
        let response = self.layer.network().send(&request).await?;
        return Ok(Served::from_network(response));
      }
      Err(e) => return Err(e),
    };
    let generation = claim.generation();
    let partition = generation.partition(kind);

    match class {
      ResourceClass::Image => {
        self
          .layer
          .cache_first(partition, &request, Some(image_placeholder()))
          .await
      }
      ResourceClass::Static => self.layer.cache_first(partition, &request, None).await,
      ResourceClass::CriticalApi => Ok(
        self
          .layer
          .stale_while_revalidate(partition, &request, claim.clone())
          .await,
      ),
      ResourceClass::CacheableApi => Ok(self.layer.network_first_api(partition, &request).await),
      // Dynamic; pass-through returned above
      _ => {
        let offline_page = (generation.partition(PartitionKind::Static), &self.offline_page);
        self
          .layer
          .network_first_page(partition, &request, Some(offline_page))
          .await
      }
    }
  }

  /// Uncached request. Failures still get a structured offline answer.
  async fn pass_through(&self, request: &Request) -> Result<Served> {
    match self.layer.network().send(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(e) => {
        info!(url = %request.url, error = %e, "pass-through request failed offline");
        Ok(Served::fallback(offline_api_response()))
      }
    }
  }

  /// Mutations go straight to the network; if it is unreachable they are
  /// queued for replay and the caller is told so.
  async fn forward_mutation(&self, request: &Request) -> Result<Served> {
    match self.layer.network().send(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(e) => {
        info!(method = %request.method, url = %request.url, error = %e, "mutation failed, queueing");
        let action = self.outbox.enqueue(request)?;
        Ok(Served::queued(queued_response(&action.id)))
      }
    }
  }

  async fn on_message(&self, message: ClientMessage) -> Result<EventOutcome> {
    match message {
      ClientMessage::VersionReady => {
        info!("application asked to activate the waiting version");
        self
          .lifecycle
          .skip_waiting()
          .await
          .map(EventOutcome::Activated)
      }
      ClientMessage::PrecacheUrls(urls) => {
        self.precache_urls(&urls).await?;
        Ok(EventOutcome::Handled)
      }
    }
  }

  /// Fetch an ad-hoc URL list into each URL's class partition. Returns how
  /// many were stored; unreachable or uncacheable URLs are skipped.
  pub async fn precache_urls(&self, urls: &[String]) -> Result<usize> {
    let claim = self.lifecycle.claim().await?;
    let generation = claim.generation();

    let targets: Vec<(Request, PartitionKind)> = urls
      .iter()
      .filter_map(|raw| match self.origin.join(raw) {
        Ok(url) => Some(Request::get(url)),
        Err(e) => {
          warn!(url = %raw, error = %e, "skipping invalid precache URL");
          None
        }
      })
      .filter_map(|request| {
        let kind = PartitionKind::for_class(self.classifier.classify(&request))?;
        Some((request, kind))
      })
      .collect();

    let network = self.layer.network();
    let responses = join_all(targets.iter().map(|(request, _)| network.send(request))).await;

    let mut stored = 0;
    for ((request, kind), response) in targets.iter().zip(responses) {
      match response {
        Ok(response) if response.is_success() => {
          let response = match kind {
            PartitionKind::Api => stamp_cached_at(response),
            _ => response,
          };
          if self
            .layer
            .write(generation.partition(*kind), CacheEntry::new(request, response))
          {
            stored += 1;
          }
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "precache URL rejected")
        }
        Err(e) => warn!(url = %request.url, error = %e, "precache URL unreachable"),
      }
    }

    info!(requested = urls.len(), stored, "precached ad-hoc URLs");
    Ok(stored)
  }

  pub async fn status(&self) -> Result<RelayStatus> {
    let partitions = self
      .store
      .partitions()?
      .into_iter()
      .map(|name| -> Result<PartitionStatus> {
        let entries = self.store.count(&name)?;
        Ok(PartitionStatus { name, entries })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(RelayStatus {
      active_version: self.lifecycle.active_version().await,
      waiting_version: self.lifecycle.waiting_version().await,
      partitions,
      queued_actions: self.outbox.pending()?.len(),
    })
  }

  /// Wait for outstanding background revalidations.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }
}

fn queued_response(id: &str) -> StoredResponse {
  StoredResponse::json(202, &json!({ "queued": true, "offline": true, "id": id }))
}
