//! Partition naming, per-partition limits and version manifests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::classify::ResourceClass;

/// Logical partition names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
  Static,
  Dynamic,
  Api,
  Image,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 4] = [
    PartitionKind::Static,
    PartitionKind::Dynamic,
    PartitionKind::Api,
    PartitionKind::Image,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
      Self::Image => "image",
    }
  }

  /// Position within `ALL`.
  fn index(self) -> usize {
    match self {
      Self::Static => 0,
      Self::Dynamic => 1,
      Self::Api => 2,
      Self::Image => 3,
    }
  }

  /// Partition a resource class is cached in. `None` for uncacheable classes.
  pub fn for_class(class: ResourceClass) -> Option<Self> {
    match class {
      ResourceClass::Static => Some(Self::Static),
      ResourceClass::Image => Some(Self::Image),
      ResourceClass::CriticalApi | ResourceClass::CacheableApi => Some(Self::Api),
      ResourceClass::Dynamic => Some(Self::Dynamic),
      ResourceClass::PassThrough => None,
    }
  }
}

impl fmt::Display for PartitionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Maximum entry counts per partition. `None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLimits {
  #[serde(rename = "static", default)]
  pub static_assets: Option<usize>,
  #[serde(default = "default_dynamic_limit")]
  pub dynamic: Option<usize>,
  #[serde(default = "default_api_limit")]
  pub api: Option<usize>,
  #[serde(default = "default_image_limit")]
  pub image: Option<usize>,
}

fn default_dynamic_limit() -> Option<usize> {
  Some(50)
}

fn default_api_limit() -> Option<usize> {
  Some(100)
}

fn default_image_limit() -> Option<usize> {
  Some(200)
}

impl Default for PartitionLimits {
  fn default() -> Self {
    Self {
      static_assets: None,
      dynamic: default_dynamic_limit(),
      api: default_api_limit(),
      image: default_image_limit(),
    }
  }
}

impl PartitionLimits {
  pub fn limit_for(&self, kind: PartitionKind) -> Option<usize> {
    match kind {
      PartitionKind::Static => self.static_assets,
      PartitionKind::Dynamic => self.dynamic,
      PartitionKind::Api => self.api,
      PartitionKind::Image => self.image,
    }
  }
}

/// One versioned partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
  pub kind: PartitionKind,
  pub version: String,
  pub max_entries: Option<usize>,
}

impl Partition {
  /// Physical store name, e.g. `static-v3`.
  pub fn name(&self) -> String {
    partition_name(self.kind, &self.version)
  }
}

pub fn partition_name(kind: PartitionKind, version: &str) -> String {
  format!("{}-{}", kind, version)
}

/// The full set of partitions belonging to one deployed version.
#[derive(Debug, Clone)]
pub struct Generation {
  version: String,
  partitions: Vec<Partition>,
}

impl Generation {
  pub fn new(version: &str, limits: &PartitionLimits) -> Self {
    let partitions = PartitionKind::ALL
      .iter()
      .map(|&kind| Partition {
        kind,
        version: version.to_string(),
        max_entries: limits.limit_for(kind),
      })
      .collect();

    Self {
      version: version.to_string(),
      partitions,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn partition(&self, kind: PartitionKind) -> &Partition {
    &self.partitions[kind.index()]
  }

  pub fn manifest(&self) -> VersionManifest {
    VersionManifest {
      names: self.partitions.iter().map(Partition::name).collect(),
    }
  }
}

/// Whitelist of partition names that survive activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionManifest {
  names: BTreeSet<String>,
}

impl VersionManifest {
  pub fn contains(&self, name: &str) -> bool {
    self.names.contains(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }
}
