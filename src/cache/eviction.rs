//! Bounded-size enforcement for partitions.

use color_eyre::Result;
use tracing::debug;

use super::partition::Partition;
use super::traits::PartitionStore;

/// Trim a partition back to its `max_entries` after a write, oldest
/// insertions first. Returns the number of entries removed.
///
/// Reads do not refresh an entry's position, so this is insertion order
/// rather than true LRU.
pub fn after_write(store: &dyn PartitionStore, partition: &Partition) -> Result<usize> {
  let Some(max) = partition.max_entries else {
    return Ok(0);
  };

  let name = partition.name();
  let count = store.count(&name)?;
  if count <= max {
    return Ok(0);
  }

  let removed = store.evict_oldest(&name, count - max)?;
  debug!(partition = %name, removed, max, "evicted oldest entries");
  Ok(removed)
}
