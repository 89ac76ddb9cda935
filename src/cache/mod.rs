//! Versioned response caching.
//!
//! Responses live in named partitions (`static-v3`, `api-v3`, ...) inside a
//! [`PartitionStore`]. The [`CacheLayer`] implements the serving strategies
//! on top of a store and the network:
//! - cache-first for static assets and images
//! - stale-while-revalidate for critical API data
//! - network-first for other API data and pages, with offline fallbacks
//!
//! Every write is followed by eviction of the oldest entries beyond the
//! partition's limit.

pub mod eviction;
mod layer;
mod partition;
mod storage;
mod traits;

pub use layer::{image_placeholder, offline_api_response, stamp_cached_at, CacheLayer};
pub use partition::{
  partition_name, Generation, Partition, PartitionKind, PartitionLimits, VersionManifest,
};
pub use storage::SqliteStorage;
pub use traits::{CacheEntry, CacheSource, PartitionStore, Served};
