//! Version lifecycle: install, wait, activate.
//!
//! Each deployed version moves through `Installing -> Waiting -> Activating
//! -> Active`. The phases are serialized behind one lock, so an install and an
//! activation never overlap. Request handlers hold a [`Claim`] on the live
//! generation for as long as they (or their background work) touch its
//! partitions; activation takes the write side of the same lock and so waits
//! for every outstanding claim before deleting anything.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::cache::{
  eviction, partition_name, CacheEntry, Generation, PartitionKind, PartitionLimits,
  PartitionStore,
};
use crate::error::{RelayError, Result};
use crate::http::Request;
use crate::messaging::{MessageChannel, RelayMessage};
use crate::network::Network;

/// Lifecycle state of one deployed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
  Installing,
  Waiting,
  Activating,
  Active,
  /// Superseded or failed; never intercepts again
  Redundant,
}

impl fmt::Display for VersionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Installing => write!(f, "installing"),
      Self::Waiting => write!(f, "waiting"),
      Self::Activating => write!(f, "activating"),
      Self::Active => write!(f, "active"),
      Self::Redundant => write!(f, "redundant"),
    }
  }
}

type Live = Option<Arc<Generation>>;

/// Read claim on the live generation.
///
/// While any clone of a claim exists, activation of another version waits.
#[derive(Clone)]
pub struct Claim {
  generation: Arc<Generation>,
  _guard: Arc<OwnedRwLockReadGuard<Live>>,
}

impl Claim {
  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  /// A claim backed by a private lock, for exercising strategies directly.
  #[cfg(test)]
  pub(crate) fn for_test(generation: Arc<Generation>) -> Self {
    let lock = Arc::new(RwLock::new(Some(Arc::clone(&generation))));
    let guard = lock
      .try_read_owned()
      .expect("fresh lock is uncontended");
    Self {
      generation,
      _guard: Arc::new(guard),
    }
  }
}

/// What the lifecycle needs to know about the deployment.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
  pub origin: Url,
  /// Paths or absolute URLs fetched into the static partition on install
  pub precache: Vec<String>,
  pub limits: PartitionLimits,
}

#[derive(Default)]
struct Phases {
  waiting: Option<Arc<Generation>>,
  states: HashMap<String, VersionState>,
}

/// Owns store versioning and decides which generation intercepts requests.
pub struct LifecycleManager {
  store: Arc<dyn PartitionStore>,
  network: Arc<dyn Network>,
  settings: LifecycleSettings,
  channel: MessageChannel,
  live: Arc<RwLock<Live>>,
  phases: Mutex<Phases>,
}

impl LifecycleManager {
  pub fn new(
    store: Arc<dyn PartitionStore>,
    network: Arc<dyn Network>,
    settings: LifecycleSettings,
    channel: MessageChannel,
  ) -> Self {
    Self {
      store,
      network,
      settings,
      channel,
      live: Arc::new(RwLock::new(None)),
      phases: Mutex::new(Phases::default()),
    }
  }

  /// Claim the live generation for the duration of a request.
  pub async fn claim(&self) -> Result<Claim> {
    let guard = Arc::clone(&self.live).read_owned().await;
    let generation = guard.as_ref().cloned().ok_or(RelayError::NoActiveVersion)?;
    Ok(Claim {
      generation,
      _guard: Arc::new(guard),
    })
  }

  pub async fn active_version(&self) -> Option<String> {
    self
      .live
      .read()
      .await
      .as_ref()
      .map(|g| g.version().to_string())
  }

  pub async fn waiting_version(&self) -> Option<String> {
    self
      .phases
      .lock()
      .await
      .waiting
      .as_ref()
      .map(|g| g.version().to_string())
  }

  pub async fn state(&self, version: &str) -> Option<VersionState> {
    self.phases.lock().await.states.get(version).copied()
  }

  /// Bring `version` up at startup.
  ///
  /// The store records which version was last activated; only that version
  /// resumes as active, without touching the network. If `version` differs,
  /// it goes back to `Waiting` (reinstalling first if it was never
  /// installed) and still needs an explicit activation. With no recorded
  /// active version, an installed `version` activates through the normal
  /// path, so partitions outside its manifest are deleted first.
  pub async fn boot(&self, version: &str) -> Result<()> {
    let recorded = match self.store.active_version()? {
      Some(active) if self.is_installed(&active)? => Some(active),
      _ => None,
    };

    if let Some(active) = recorded {
      self.resume(&active).await;
      if active == version {
        info!(version, "resumed active version");
        return Ok(());
      }
      info!(version = %active, "serving recorded version while {} waits", version);
      if self.is_installed(version)? {
        let mut phases = self.phases.lock().await;
        self.mark_waiting(&mut phases, Arc::new(Generation::new(version, &self.settings.limits)));
        return Ok(());
      }
      return self.install(version).await.map(|_| ());
    }

    if self.is_installed(version)? {
      info!(version, "activating installed version");
      let mut phases = self.phases.lock().await;
      phases.waiting = Some(Arc::new(Generation::new(version, &self.settings.limits)));
      return self.activate_locked(&mut phases).await.map(|_| ());
    }

    self.install(version).await.map(|_| ())
  }

  /// Whether `version`'s static partition exists.
  fn is_installed(&self, version: &str) -> Result<bool> {
    let name = partition_name(PartitionKind::Static, version);
    Ok(self.store.partitions()?.contains(&name))
  }

  /// Make `version` live without activation side effects.
  async fn resume(&self, version: &str) {
    let generation = Arc::new(Generation::new(version, &self.settings.limits));
    let mut phases = self.phases.lock().await;
    *self.live.write().await = Some(generation);
    phases
      .states
      .insert(version.to_string(), VersionState::Active);
  }

  /// Install `version`: fetch the whole precache manifest, then store it in
  /// the version's static partition.
  ///
  /// Any unreachable or non-success URL fails the install before anything is
  /// written, leaving the current active version untouched. On success the
  /// version waits, unless nothing is active yet, in which case it
  /// activates immediately. Returns the resulting state.
  pub async fn install(&self, version: &str) -> Result<VersionState> {
    {
      let mut phases = self.phases.lock().await;
      if self.active_version().await.as_deref() == Some(version) {
        info!(version, "version already active, skipping install");
        return Ok(VersionState::Active);
      }
      phases
        .states
        .insert(version.to_string(), VersionState::Installing);
    }
    info!(version, urls = self.settings.precache.len(), "installing");

    // Fetched without holding the phase lock
    let generation = Arc::new(Generation::new(version, &self.settings.limits));
    let fetched = self.fetch_manifest().await;

    let mut phases = self.phases.lock().await;
    if let Err(reason) = fetched.and_then(|entries| self.store_manifest(&generation, &entries)) {
      phases
        .states
        .insert(version.to_string(), VersionState::Redundant);
      warn!(version, %reason, "install failed, keeping current version");
      return Err(RelayError::Install {
        version: version.to_string(),
        reason,
      });
    }

    self.mark_waiting(&mut phases, Arc::clone(&generation));
    info!(version, "installed, waiting");

    if self.live.read().await.is_none() {
      self.activate_locked(&mut phases).await?;
      return Ok(VersionState::Active);
    }

    self.channel.publish(RelayMessage::VersionWaiting {
      version: version.to_string(),
    });
    Ok(VersionState::Waiting)
  }

  /// Park `generation` as the waiting version, superseding any other.
  fn mark_waiting(&self, phases: &mut Phases, generation: Arc<Generation>) {
    let version = generation.version().to_string();
    if let Some(superseded) = phases.waiting.replace(generation) {
      if superseded.version() != version {
        phases
          .states
          .insert(superseded.version().to_string(), VersionState::Redundant);
      }
    }
    phases.states.insert(version, VersionState::Waiting);
  }

  /// Fetch every manifest URL. Fails on the first unreachable or
  /// non-success URL.
  async fn fetch_manifest(&self) -> std::result::Result<Vec<CacheEntry>, String> {
    let requests = self
      .settings
      .precache
      .iter()
      .map(|entry| {
        self
          .settings
          .origin
          .join(entry)
          .map(Request::get)
          .map_err(|e| format!("invalid precache URL '{}': {}", entry, e))
      })
      .collect::<std::result::Result<Vec<_>, _>>()?;

    let responses = join_all(requests.iter().map(|r| self.network.send(r))).await;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      match response {
        Ok(response) if response.is_success() => {
          entries.push(CacheEntry::new(request, response));
        }
        Ok(response) => {
          return Err(format!("{} returned {}", request.url, response.status));
        }
        Err(e) => return Err(format!("{}: {}", request.url, e)),
      }
    }
    Ok(entries)
  }

  /// Write fetched entries to the static partition. A storage failure
  /// part-way removes the partial partition.
  fn store_manifest(
    &self,
    generation: &Generation,
    entries: &[CacheEntry],
  ) -> std::result::Result<(), String> {
    let partition = generation.partition(PartitionKind::Static);
    let name = partition.name();
    for entry in entries {
      let written = self
        .store
        .put(&name, entry)
        .and_then(|_| eviction::after_write(self.store.as_ref(), partition));
      if let Err(e) = written {
        if let Err(cleanup) = self.store.delete_partition(&name) {
          warn!(partition = %name, error = %cleanup, "failed to remove partial partition");
        }
        return Err(format!("storing {}: {}", entry.url, e));
      }
    }
    Ok(())
  }

  /// Activate the waiting version, if any. Returns the activated version.
  ///
  /// This is only reached through an explicit request (`VERSION_READY` or an
  /// operator call), except for the very first install.
  pub async fn skip_waiting(&self) -> Result<Option<String>> {
    let mut phases = self.phases.lock().await;
    if phases.waiting.is_none() {
      info!("no waiting version to activate");
      return Ok(None);
    }
    self.activate_locked(&mut phases).await.map(Some)
  }

  /// Delete every partition outside the waiting version's manifest, then make
  /// it live. Waits for all outstanding claims on the old generation first.
  async fn activate_locked(&self, phases: &mut Phases) -> Result<String> {
    let generation = phases.waiting.take().ok_or(RelayError::NoActiveVersion)?;
    let version = generation.version().to_string();
    phases
      .states
      .insert(version.clone(), VersionState::Activating);
    info!(version = %version, "activating");

    let mut live = self.live.write().await;

    let retired = self.retire_partitions(&generation).and_then(|()| {
      self
        .store
        .set_active_version(&version)
        .map_err(RelayError::from)
    });
    if let Err(e) = retired {
      // Keep the old generation serving and leave the new one waiting
      phases.states.insert(version.clone(), VersionState::Waiting);
      phases.waiting = Some(generation);
      warn!(version = %version, error = %e, "activation failed");
      return Err(e);
    }

    let previous = live.replace(Arc::clone(&generation));
    drop(live);

    if let Some(previous) = previous {
      if previous.version() != version {
        phases
          .states
          .insert(previous.version().to_string(), VersionState::Redundant);
      }
    }
    phases.states.insert(version.clone(), VersionState::Active);
    info!(version = %version, "active");

    self.channel.publish(RelayMessage::VersionActivated {
      version: version.clone(),
    });
    Ok(version)
  }

  fn retire_partitions(&self, generation: &Generation) -> Result<()> {
    let manifest = generation.manifest();
    for name in self.store.partitions()? {
      if manifest.contains(&name) {
        continue;
      }
      self.store.delete_partition(&name)?;
      info!(partition = %name, "deleted retired partition");
    }
    Ok(())
  }
}
