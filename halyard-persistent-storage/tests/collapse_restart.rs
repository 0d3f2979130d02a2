mod common;

use common::{open_stores, rebuild, set_op};
use halyard_core::{apply_operation, KeyValueState};
use halyard_persistent_storage::Collapser;
use tempfile::TempDir;

/// Test: state is identical before and after collapse + restart
///
/// Purpose
/// - Collapsing must never lose or reorder an entry: snapshot + remaining WAL
///   has to equal a straight replay of every operation
///
/// Flow
/// - Append 50 operations (5 per segment), collapse keeping 2 segments
/// - Append 7 more, restart both stores
///
/// Expected
/// - Rebuilt state equals the reference replay; indices continue at 58
#[tokio::test]
async fn collapse_then_restart_preserves_state() {
    let tmp = TempDir::new().unwrap();
    let mut reference = KeyValueState::new();

    {
        let (wal, snapshots) = open_stores(tmp.path(), 5).await;
        for i in 1..=50 {
            let op = set_op(i);
            apply_operation(&mut reference, &op);
            wal.append(1, op).await.unwrap();
        }
        let collapser = Collapser::new(wal.clone(), snapshots.clone());
        let report = collapser.collapse(2, wal.last_index()).await.unwrap();
        assert_eq!(report.target, 41);
        assert_eq!(wal.first_index(), 41);

        for i in 51..=57 {
            let op = set_op(i);
            apply_operation(&mut reference, &op);
            wal.append(2, op).await.unwrap();
        }
        wal.shutdown().await;
    }

    let (wal, snapshots) = open_stores(tmp.path(), 5).await;
    assert_eq!(snapshots.up_to_index().await, 40);
    assert_eq!(wal.first_index(), 41);
    assert_eq!(wal.last_index(), 57);
    assert_eq!(wal.last_epoch().await, 2);
    assert_eq!(rebuild(&wal, &snapshots).await, reference);
    assert_eq!(wal.append(2, set_op(58)).await.unwrap(), 58);
}

/// Test: interrupted truncation is finished by the next collapse
///
/// Purpose
/// - A crash after the snapshot install but before the prefix truncation leaves
///   old segments behind; the next collapse must clean them without refolding
///
/// Expected
/// - Second collapse folds nothing and removes the stale segments
#[tokio::test]
async fn collapse_finishes_interrupted_truncation() {
    let tmp = TempDir::new().unwrap();
    let (wal, snapshots) = open_stores(tmp.path(), 4).await;
    for i in 1..=20 {
        wal.append(1, set_op(i)).await.unwrap();
    }
    let collapser = Collapser::new(wal.clone(), snapshots.clone());

    // a pin stands in for the crash: the snapshot lands, the truncation cannot
    let pin = wal.pin(1);
    let first = collapser.collapse(1, 20).await.unwrap();
    assert_eq!(first.snapshot_up_to, 16);
    assert_eq!(first.removed_segments, 0);
    drop(pin);

    let second = collapser.collapse(1, 20).await.unwrap();
    assert_eq!(second.folded_entries, 0);
    assert_eq!(second.removed_segments, 4);
    assert_eq!(rebuild(&wal, &snapshots).await.len(), 17);
}
