use crate::snapshot_store::{SnapshotStore, StoredSnapshot};
use halyard_core::{KeyValueState, Snapshot};
use tempfile::TempDir;

fn stored(up_to: u64, pairs: &[(&str, &str)]) -> StoredSnapshot {
    let mut state = KeyValueState::new();
    for (k, v) in pairs {
        state.insert(k.to_string(), v.as_bytes().to_vec());
    }
    StoredSnapshot {
        snapshot: Snapshot {
            up_to_index: up_to,
            state,
        },
        epoch: 2,
    }
}

/// Test: snapshot survives reopen
///
/// Purpose
/// - A freshly opened store is empty; an installed snapshot is reloaded after restart
///
/// Expected
/// - Reopened active snapshot equals the installed one
#[tokio::test]
async fn install_then_reopen() {
    let tmp = TempDir::new().unwrap();
    let store = SnapshotStore::open(tmp.path()).await.unwrap();
    assert_eq!(store.up_to_index().await, 0);

    store.install(stored(10, &[("a", "1")]), "collapse").await.unwrap();
    drop(store);

    let reopened = SnapshotStore::open(tmp.path()).await.unwrap();
    let active = reopened.active().await;
    assert_eq!(active.up_to_index(), 10);
    assert_eq!(active.epoch, 2);
    assert_eq!(active.snapshot.state.get("a"), Some(&b"1".to_vec()));
}

/// Test: superseded snapshot outlives its readers
///
/// Purpose
/// - A reader holding the old snapshot keeps it (and its file) until released
///
/// Flow
/// - Install 5, grab it, install 9
/// - gc reports one held snapshot and the old file still exists
/// - Drop the reader, gc again
///
/// Expected
/// - Old file removed only after the reader is gone
#[tokio::test]
async fn retired_snapshot_kept_while_referenced() {
    let tmp = TempDir::new().unwrap();
    let store = SnapshotStore::open(tmp.path()).await.unwrap();

    store.install(stored(5, &[("a", "1")]), "collapse").await.unwrap();
    let reader = store.active().await;
    store.install(stored(9, &[("a", "2")]), "collapse").await.unwrap();

    assert_eq!(store.gc().await.unwrap(), 1);
    assert!(tmp.path().join("snapshot.5.db").exists());
    assert_eq!(reader.snapshot.state.get("a"), Some(&b"1".to_vec()));

    drop(reader);
    assert_eq!(store.gc().await.unwrap(), 0);
    assert!(!tmp.path().join("snapshot.5.db").exists());
    assert!(tmp.path().join("snapshot.9.db").exists());
    assert!(store.disk_usage().await > 0);
}

/// Test: corrupt newest snapshot falls back
///
/// Expected
/// - A snapshot file with a bad CRC is discarded and the older valid one becomes active
#[tokio::test]
async fn corrupt_snapshot_is_discarded() {
    let tmp = TempDir::new().unwrap();
    {
        let store = SnapshotStore::open(tmp.path()).await.unwrap();
        let keep = store.install(stored(3, &[("x", "y")]), "collapse").await.unwrap();
        // hold the old one so its file survives the next install
        store.install(stored(7, &[("x", "z")]), "collapse").await.unwrap();
        drop(keep);
    }
    let newest = tmp.path().join("snapshot.7.db");
    let mut bytes = std::fs::read(&newest).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&newest, bytes).unwrap();

    let store = SnapshotStore::open(tmp.path()).await.unwrap();
    assert_eq!(store.up_to_index().await, 3);
    assert!(!newest.exists());
}
