use std::path::Path;
use std::sync::Arc;

use futures::TryStreamExt;
use halyard_core::{apply_operation, KeyValueState, Operation};
use halyard_persistent_storage::{SnapshotStore, Wal, WalConfig};

/// Opens the WAL under `<dir>/tlog` and the snapshot store under `<dir>/db`.
pub async fn open_stores(dir: &Path, per_segment: u64) -> (Wal, Arc<SnapshotStore>) {
    let wal = Wal::open(WalConfig::new(dir.join("tlog")).with_entries_per_segment(per_segment))
        .await
        .expect("open wal");
    let snapshots = SnapshotStore::open(dir.join("db")).await.expect("open snapshots");
    (wal, Arc::new(snapshots))
}

pub fn set_op(i: u64) -> Operation {
    Operation::set(format!("key-{:03}", i % 17), format!("v{}", i).into_bytes())
}

/// Rebuilds state the way a restarting node does: active snapshot, then the
/// WAL from the entry after it.
pub async fn rebuild(wal: &Wal, snapshots: &SnapshotStore) -> KeyValueState {
    let active = snapshots.active().await;
    let mut state = active.snapshot.state.clone();
    let stream = wal
        .read(active.up_to_index() + 1, u64::MAX)
        .await
        .expect("read wal tail");
    let entries: Vec<_> = stream.try_collect().await.expect("collect wal tail");
    for entry in entries {
        apply_operation(&mut state, &entry.payload);
    }
    state
}
