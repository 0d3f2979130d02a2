mod errors;
pub use errors::{PersistentStorageError, Result};

pub mod wal;
pub use wal::{LogStream, PinGuard, SegmentMeta, Wal, WalConfig};

// Atomic bincode checkpoints (WAL base, election promises)
pub mod checkpoint;
pub use checkpoint::{read_checkpoint, write_checkpoint, ElectionCheckpoint, WalCheckpoint};

mod snapshot_store;
pub use snapshot_store::{SnapshotStore, StoredSnapshot};

mod collapser;
pub use collapser::{ChunkHook, CollapseGuard, CollapseReport, Collapser, Slowdown};

pub mod utilization;

// Shared frame utilities (header size, CRC-checked scanning)
mod frames;

pub mod persistent_metrics;

// Unit tests
#[cfg(test)]
mod collapser_test;
#[cfg(test)]
mod snapshot_store_test;
