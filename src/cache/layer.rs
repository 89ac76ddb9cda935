//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::eviction;
use super::partition::Partition;
use super::traits::{CacheEntry, PartitionStore, Served};
use crate::error::{NetworkError, Result};
use crate::http::{Request, RequestKey, StoredResponse, CACHED_AT_HEADER};
use crate::lifecycle::Claim;
use crate::network::Network;

/// Runs the per-class caching strategies against the partition store.
///
/// Storage failures never fail a request: reads degrade to a miss and writes
/// are dropped, so the layer behaves as a pass-through.
pub struct CacheLayer {
  store: Arc<dyn PartitionStore>,
  network: Arc<dyn Network>,
  /// Background revalidations still running
  revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheLayer {
  pub fn new(store: Arc<dyn PartitionStore>, network: Arc<dyn Network>) -> Self {
    Self {
      store,
      network,
      revalidations: Mutex::new(Vec::new()),
    }
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  /// Look up a usable stored entry. Non-success entries never count as hits.
  pub fn lookup(&self, partition: &Partition, key: &RequestKey) -> Option<CacheEntry> {
    let name = partition.name();
    match self.store.get(&name, key) {
      Ok(Some(entry)) if entry.response.is_success() => Some(entry),
      Ok(_) => None,
      Err(e) => {
        warn!(partition = %name, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Store an entry and enforce the partition limit.
  pub fn write(&self, partition: &Partition, entry: CacheEntry) -> bool {
    store_entry(self.store.as_ref(), partition, &entry)
  }

  /// Cache-first: serve the stored entry without touching the network,
  /// otherwise fetch and store. With no entry and no network the
  /// placeholder is served if one is given, else the failure propagates.
  pub async fn cache_first(
    &self,
    partition: &Partition,
    request: &Request,
    placeholder: Option<StoredResponse>,
  ) -> Result<Served> {
    if let Some(entry) = self.lookup(partition, &request.key()) {
      debug!(url = %request.url, "cache hit");
      return Ok(served_from_cache(request, entry));
    }

    match self.network.send(request).await {
      Ok(response) => {
        if is_storable(request, &response) {
          self.write(partition, CacheEntry::new(request, response.clone()));
        }
        Ok(Served::from_network(response))
      }
      Err(e) => match placeholder {
        Some(placeholder) => {
          info!(url = %request.url, error = %e, "offline with no stored entry, serving placeholder");
          Ok(Served::fallback(placeholder))
        }
        None => Err(e.into()),
      },
    }
  }

  /// Stale-while-revalidate: a stored entry is returned immediately while a
  /// detached task refreshes it. The task holds `claim` so its generation
  /// outlives it, and its outcome never reaches the caller.
  ///
  /// Without a stored entry this is `network_first_api` for this request.
  pub async fn stale_while_revalidate(
    &self,
    partition: &Partition,
    request: &Request,
    claim: Claim,
  ) -> Served {
    match self.lookup(partition, &request.key()) {
      Some(entry) => {
        debug!(url = %request.url, "serving stored entry, revalidating in background");
        self.spawn_revalidation(partition, request, claim);
        served_from_cache(request, entry)
      }
      None => self.network_first_api(partition, request).await,
    }
  }

  /// Network-first for API data. Successful responses are stored with a
  /// `cached-at` stamp. With no network and no stored entry the caller gets
  /// a structured offline response instead of an error.
  pub async fn network_first_api(&self, partition: &Partition, request: &Request) -> Served {
    match self.network_then_cache(partition, request, true).await {
      Ok(served) => served,
      Err(e) => {
        info!(url = %request.url, error = %e, "API unavailable offline");
        Served::fallback(offline_api_response())
      }
    }
  }

  /// Network-first for pages and other dynamic content. Navigations fall
  /// back to the precached offline page; anything else propagates the
  /// network failure.
  pub async fn network_first_page(
    &self,
    partition: &Partition,
    request: &Request,
    offline_page: Option<(&Partition, &RequestKey)>,
  ) -> Result<Served> {
    match self.network_then_cache(partition, request, false).await {
      Ok(served) => Ok(served),
      Err(e) => {
        if request.navigate {
          if let Some(page) = offline_page.and_then(|(p, key)| self.lookup(p, key)) {
            info!(url = %request.url, "offline navigation, serving offline page");
            return Ok(Served::fallback(page.response));
          }
        }
        Err(e.into())
      }
    }
  }

  /// Network attempt, then cache write or cache fallback.
  ///
  /// A non-success status is not stored; a stored entry is preferred over
  /// it, otherwise the status response is passed through.
  async fn network_then_cache(
    &self,
    partition: &Partition,
    request: &Request,
    stamp: bool,
  ) -> std::result::Result<Served, NetworkError> {
    match self.network.send(request).await {
      Ok(response) if response.is_success() => {
        if is_storable(request, &response) {
          let stored = if stamp {
            stamp_cached_at(response.clone())
          } else {
            response.clone()
          };
          self.write(partition, CacheEntry::new(request, stored));
        }
        Ok(Served::from_network(response))
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "non-success response, checking cache");
        Ok(
          self
            .lookup(partition, &request.key())
            .map(Served::offline)
            .unwrap_or_else(|| Served::from_network(response)),
        )
      }
      Err(e) => match self.lookup(partition, &request.key()) {
        Some(entry) => {
          info!(url = %request.url, error = %e, "network failed, serving stored entry");
          Ok(Served::offline(entry))
        }
        None => Err(e),
      },
    }
  }

  fn spawn_revalidation(&self, partition: &Partition, request: &Request, claim: Claim) {
    let store = Arc::clone(&self.store);
    let network = Arc::clone(&self.network);
    let partition = partition.clone();
    let mut request = request.clone();
    request.method = Method::GET;

    let handle = tokio::spawn(async move {
      let _claim = claim;
      match network.send(&request).await {
        Ok(response) if response.is_success() => {
          let entry = CacheEntry::new(&request, stamp_cached_at(response));
          if store_entry(store.as_ref(), &partition, &entry) {
            debug!(url = %request.url, "revalidated");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation rejected, keeping stored entry");
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "revalidation failed, keeping stored entry");
        }
      }
    });

    if let Ok(mut pending) = self.revalidations.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }
  }

  /// Wait for every background revalidation started so far.
  pub async fn settle(&self) {
    let pending: Vec<JoinHandle<()>> = match self.revalidations.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(_) => Vec::new(),
    };
    for handle in pending {
      let _ = handle.await;
    }
  }
}

fn store_entry(store: &dyn PartitionStore, partition: &Partition, entry: &CacheEntry) -> bool {
  let name = partition.name();
  if let Err(e) = store.put(&name, entry) {
    warn!(partition = %name, url = %entry.url, error = %e, "cache write failed, continuing uncached");
    return false;
  }
  if let Err(e) = eviction::after_write(store, partition) {
    warn!(partition = %name, error = %e, "eviction failed");
  }
  true
}

/// A stored hit; HEAD gets the stored status and headers without the body.
fn served_from_cache(request: &Request, mut entry: CacheEntry) -> Served {
  if request.method == Method::HEAD {
    entry.response.body.clear();
  }
  Served::from_cache(entry)
}

/// Only successful GET responses are stored (HEAD bodies are empty).
fn is_storable(request: &Request, response: &StoredResponse) -> bool {
  request.method == Method::GET && response.is_success()
}

/// Add the `cached-at` header every stored API response carries.
pub fn stamp_cached_at(response: StoredResponse) -> StoredResponse {
  let now = Utc::now().timestamp_millis().to_string();
  response.with_header(CACHED_AT_HEADER, &now)
}

/// Structured response for API data that is unavailable offline.
pub fn offline_api_response() -> StoredResponse {
  StoredResponse::json(
    503,
    &json!({
      "offline": true,
      "error": "offline",
      "message": "This data is not available offline"
    }),
  )
}

/// Minimal inline image served when an image is neither cached nor reachable.
pub fn image_placeholder() -> StoredResponse {
  const SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#e5e7eb"/><text x="100" y="105" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle">Offline</text></svg>"##;

  StoredResponse::new(200, SVG)
    .with_header("content-type", "image/svg+xml")
    .with_header("cache-control", "no-store")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::partition::{Generation, PartitionKind, PartitionLimits};
  use crate::cache::CacheSource;
  use crate::error::RelayError;
  use crate::testing::{memory_store, url, FakeNetwork};
  use color_eyre::eyre::eyre;
  use std::time::{Duration, Instant};

  fn setup() -> (Arc<FakeNetwork>, Arc<crate::cache::SqliteStorage>, CacheLayer, Generation) {
    let network = FakeNetwork::new();
    let store = memory_store();
    let layer = CacheLayer::new(store.clone(), network.clone());
    let generation = Generation::new("v1", &PartitionLimits::default());
    (network, store, layer, generation)
  }

  fn seed(store: &dyn PartitionStore, partition: &Partition, path: &str, body: &str) -> CacheEntry {
    let entry = CacheEntry::new(&Request::get(url(path)), StoredResponse::new(200, body));
    store.put(&partition.name(), &entry).unwrap();
    entry
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let (network, store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Static);
    let entry = seed(&*store, partition, "/app.js", "cached");
    network.respond("/app.js", 200, "fresh");

    let served = layer
      .cache_first(partition, &Request::get(url("/app.js")), None)
      .await
      .unwrap();

    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response, entry.response);
    assert!(network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_head_hit_has_no_body() {
    let (network, store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Static);
    let entry = seed(&*store, partition, "/app.js", "cached");

    let head = Request::new(Method::HEAD, url("/app.js"));
    let served = layer.cache_first(partition, &head, None).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.status, entry.response.status);
    assert_eq!(served.response.headers, entry.response.headers);
    assert!(served.response.body.is_empty());
    assert!(network.calls().is_empty());

    // The stored entry keeps its body for GET
    let get = layer
      .cache_first(partition, &Request::get(url("/app.js")), None)
      .await
      .unwrap();
    assert_eq!(get.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_cache_first_miss_stores_success_only() {
    let (network, store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Image);
    network.respond("/a.png", 200, "png");

    let served = layer
      .cache_first(partition, &Request::get(url("/a.png")), None)
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(store.count(&partition.name()).unwrap(), 1);

    // 404 is returned but never stored
    let served = layer
      .cache_first(partition, &Request::get(url("/missing.png")), None)
      .await
      .unwrap();
    assert_eq!(served.response.status, 404);
    assert_eq!(store.count(&partition.name()).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_offline_placeholder_or_error() {
    let (network, _store, layer, generation) = setup();
    network.set_offline(true);

    let image = generation.partition(PartitionKind::Image);
    let served = layer
      .cache_first(image, &Request::get(url("/a.png")), Some(image_placeholder()))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response.header("content-type"), Some("image/svg+xml"));

    let stat = generation.partition(PartitionKind::Static);
    let err = layer
      .cache_first(stat, &Request::get(url("/app.js")), None)
      .await
      .unwrap_err();
    assert!(matches!(err, RelayError::Network(_)));
  }

  #[tokio::test]
  async fn test_swr_returns_stored_without_waiting() {
    let (network, store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Api).clone();
    let entry = seed(&*store, &partition, "/api/patients/42", "old");
    network.respond("/api/patients/42", 200, "new");
    network.set_delay(Duration::from_millis(300));

    let claim = Claim::for_test(Arc::new(generation.clone()));
    let started = Instant::now();
    let served = layer
      .stale_while_revalidate(&partition, &Request::get(url("/api/patients/42")), claim)
      .await;

    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, entry.response.body);

    layer.settle().await;
    assert_eq!(network.call_count("/api/patients/42"), 1);
    let refreshed = layer.lookup(&partition, &entry.key).unwrap();
    assert_eq!(refreshed.response.body, b"new");
    assert!(refreshed.response.header(CACHED_AT_HEADER).is_some());
  }

  #[tokio::test]
  async fn test_swr_revalidation_failure_keeps_entry() {
    let (network, store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Api).clone();
    let entry = seed(&*store, &partition, "/api/patients/42", "old");
    network.fail("/api/patients/42");

    let claim = Claim::for_test(Arc::new(generation.clone()));
    let served = layer
      .stale_while_revalidate(&partition, &Request::get(url("/api/patients/42")), claim)
      .await;
    layer.settle().await;

    assert_eq!(served.response, entry.response);
    assert_eq!(network.call_count("/api/patients/42"), 1);
    assert_eq!(layer.lookup(&partition, &entry.key).unwrap(), entry);
  }

  #[tokio::test]
  async fn test_swr_cold_falls_through_to_network_first() {
    let (network, _store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Api).clone();
    let claim = Claim::for_test(Arc::new(generation.clone()));
    network.set_offline(true);

    let served = layer
      .stale_while_revalidate(&partition, &Request::get(url("/api/vitals")), claim)
      .await;
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&served.response.body).unwrap();
    assert_eq!(body["offline"], true);
  }

  #[tokio::test]
  async fn test_network_first_api_stamps_and_falls_back() {
    let (network, _store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Api);
    let request = Request::get(url("/api/symptoms?q=cough"));
    network.respond("/api/symptoms?q=cough", 200, "[1]");

    let served = layer.network_first_api(partition, &request).await;
    assert_eq!(served.source, CacheSource::Network);
    assert!(served.response.header(CACHED_AT_HEADER).is_none());
    let stored = layer.lookup(partition, &request.key()).unwrap();
    let stamp: i64 = stored.response.header(CACHED_AT_HEADER).unwrap().parse().unwrap();
    assert!(stamp > 0);

    network.set_offline(true);
    let served = layer.network_first_api(partition, &request).await;
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body, b"[1]");
  }

  #[tokio::test]
  async fn test_non_success_prefers_stored_entry() {
    let (network, store, layer, generation) = setup();
    let partition = generation.partition(PartitionKind::Api);
    seed(&*store, partition, "/api/profile", "me");
    network.respond("/api/profile", 500, "boom");

    let served = layer
      .network_first_api(partition, &Request::get(url("/api/profile")))
      .await;
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body, b"me");
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_offline_page() {
    let (network, store, layer, generation) = setup();
    let stat = generation.partition(PartitionKind::Static);
    let page = seed(&*store, stat, "/offline.html", "<h1>offline</h1>");
    network.set_offline(true);

    let dynamic = generation.partition(PartitionKind::Dynamic);
    let nav = Request::get(url("/dashboard")).navigation();
    let served = layer
      .network_first_page(dynamic, &nav, Some((stat, &page.key)))
      .await
      .unwrap();
    assert_eq!(served.response, page.response);

    let xhr = Request::get(url("/fragment"));
    let err = layer
      .network_first_page(dynamic, &xhr, Some((stat, &page.key)))
      .await
      .unwrap_err();
    assert!(matches!(err, RelayError::Network(NetworkError::Unreachable(_))));
  }

  struct BrokenStore;

  impl PartitionStore for BrokenStore {
    fn get(&self, _: &str, _: &RequestKey) -> color_eyre::Result<Option<CacheEntry>> {
      Err(eyre!("disk gone"))
    }
    fn put(&self, _: &str, _: &CacheEntry) -> color_eyre::Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn count(&self, _: &str) -> color_eyre::Result<usize> {
      Err(eyre!("disk gone"))
    }
    fn keys(&self, _: &str) -> color_eyre::Result<Vec<RequestKey>> {
      Err(eyre!("disk gone"))
    }
    fn evict_oldest(&self, _: &str, _: usize) -> color_eyre::Result<usize> {
      Err(eyre!("disk gone"))
    }
    fn partitions(&self) -> color_eyre::Result<Vec<String>> {
      Err(eyre!("disk gone"))
    }
    fn delete_partition(&self, _: &str) -> color_eyre::Result<bool> {
      Err(eyre!("disk gone"))
    }
    fn active_version(&self) -> color_eyre::Result<Option<String>> {
      Err(eyre!("disk gone"))
    }
    fn set_active_version(&self, _: &str) -> color_eyre::Result<()> {
      Err(eyre!("disk gone"))
    }
  }

  #[tokio::test]
  async fn test_storage_failure_degrades_to_pass_through() {
    let network = FakeNetwork::new();
    network.respond("/app.js", 200, "js");
    let layer = CacheLayer::new(Arc::new(BrokenStore), network.clone());
    let generation = Generation::new("v1", &PartitionLimits::default());

    let served = layer
      .cache_first(
        generation.partition(PartitionKind::Static),
        &Request::get(url("/app.js")),
        None,
      )
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"js");
  }
}
