#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use halyard_core::Operation;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Semaphore};

    use crate::collapser::{ChunkHook, Collapser};
    use crate::errors::PersistentStorageError;
    use crate::snapshot_store::SnapshotStore;
    use crate::wal::{Wal, WalConfig};

    async fn setup(dir: &std::path::Path, per_segment: u64, entries: u64) -> (Wal, Arc<SnapshotStore>) {
        let wal = Wal::open(WalConfig::new(dir.join("tlog")).with_entries_per_segment(per_segment))
            .await
            .unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.join("db")).await.unwrap());
        for i in 1..=entries {
            wal.append(1, Operation::set(format!("k{}", i % 3), i.to_string().into_bytes()))
                .await
                .unwrap();
        }
        (wal, snapshots)
    }

    /// Blocks inside the first chunk until released.
    struct Gate {
        entered: mpsc::UnboundedSender<()>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl ChunkHook for Gate {
        async fn before_chunk(&self, _chunk: usize, _next_index: u64) {
            let _ = self.entered.send(());
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }

    /// Test: collapse keeps the newest segments
    ///
    /// Purpose
    /// - Fold all but the last segment into the snapshot and drop the folded segments
    ///
    /// Expected
    /// - 10 entries, 2 per segment, keep 1: snapshot up to 8, first WAL index 9, one segment left
    #[tokio::test]
    async fn collapse_folds_all_but_kept_segments() {
        let tmp = TempDir::new().unwrap();
        let (wal, snapshots) = setup(tmp.path(), 2, 10).await;
        let collapser = Collapser::new(wal.clone(), Arc::clone(&snapshots)).with_chunk_size(3);

        let report = collapser.collapse(1, 10).await.unwrap();
        assert_eq!(report.target, 9);
        assert_eq!(report.snapshot_up_to, 8);
        assert_eq!(report.folded_entries, 8);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.removed_segments, 4);

        assert_eq!(wal.first_index(), 9);
        assert_eq!(wal.segments().await.len(), 1);
        let active = snapshots.active().await;
        assert_eq!(active.up_to_index(), 8);
        assert_eq!(active.epoch, 1);
        // k0 <- 6, k1 <- 7, k2 <- 8
        assert_eq!(active.snapshot.state.get("k2"), Some(&b"8".to_vec()));
        assert_eq!(active.snapshot.state.get("k0"), Some(&b"6".to_vec()));
    }

    /// Test: collapse never passes the applied index
    ///
    /// Expected
    /// - With applied index 4 only entries 1..=4 are folded; segments above stay
    #[tokio::test]
    async fn collapse_is_bounded_by_applied_index() {
        let tmp = TempDir::new().unwrap();
        let (wal, snapshots) = setup(tmp.path(), 2, 10).await;
        let collapser = Collapser::new(wal.clone(), Arc::clone(&snapshots));

        let report = collapser.collapse(1, 4).await.unwrap();
        assert_eq!(report.target, 5);
        assert_eq!(report.snapshot_up_to, 4);
        assert_eq!(wal.first_index(), 5);

        // nothing new to fold: a second collapse is a cheap no-op
        let again = collapser.collapse(1, 4).await.unwrap();
        assert_eq!(again.folded_entries, 0);
        assert_eq!(again.removed_segments, 0);
    }

    /// Test: concurrent collapse is rejected immediately
    ///
    /// Flow
    /// - First collapse blocks inside its first chunk (gate hook)
    /// - Second collapse is attempted while the first is parked
    /// - Release the gate
    ///
    /// Expected
    /// - Second attempt returns CollapseInProgress without waiting; first succeeds;
    ///   a later attempt succeeds again
    #[tokio::test]
    async fn concurrent_collapse_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let (wal, snapshots) = setup(tmp.path(), 2, 10).await;
        let collapser = Arc::new(Collapser::new(wal.clone(), Arc::clone(&snapshots)));

        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        collapser
            .set_hook(Arc::new(Gate {
                entered: entered_tx,
                release: Arc::clone(&release),
            }))
            .await;

        let first = {
            let c = Arc::clone(&collapser);
            tokio::spawn(async move { c.collapse(1, 10).await })
        };
        entered_rx.recv().await.expect("first collapse entered its chunk");
        assert!(collapser.is_busy());

        let second = tokio::time::timeout(Duration::from_millis(200), collapser.collapse(1, 10))
            .await
            .expect("second collapse must not wait");
        assert!(matches!(second, Err(PersistentStorageError::CollapseInProgress)));

        release.add_permits(1_000);
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.snapshot_up_to, 8);
        assert!(!collapser.is_busy());

        collapser.set_slowdown(None).await;
        assert!(collapser.collapse(1, 10).await.is_ok());
    }

    /// Test: a pinned reader keeps its range through a collapse
    ///
    /// Expected
    /// - Snapshot is installed, but segments at or above the pinned index survive and stay readable
    #[tokio::test]
    async fn collapse_respects_catchup_pin() {
        let tmp = TempDir::new().unwrap();
        let (wal, snapshots) = setup(tmp.path(), 2, 10).await;
        let collapser = Collapser::new(wal.clone(), Arc::clone(&snapshots));

        let pin = wal.pin(3);
        let report = collapser.collapse(1, 10).await.unwrap();
        assert_eq!(report.snapshot_up_to, 8);
        assert_eq!(report.removed_segments, 1);
        assert_eq!(wal.first_index(), 3);
        assert_eq!(wal.entries(3, 10).await.unwrap().len(), 8);

        drop(pin);
        let report = collapser.collapse(1, 10).await.unwrap();
        assert_eq!(report.folded_entries, 0);
        assert_eq!(wal.first_index(), 9);
    }

    /// Test: a failed collapse changes nothing and can be retried
    ///
    /// Purpose
    /// - A collapse that breaks off while folding must leave the old snapshot
    ///   and the whole log in place
    ///
    /// Flow
    /// - 20 entries, 4 per segment, no entry cache so folding reads the files
    /// - Flip the last byte of wal.2.log and collapse keeping 1 segment
    /// - Restore the byte and collapse again
    ///
    /// Expected
    /// - First attempt fails with a gap at index 8; snapshot still at 0,
    ///   first index 1, all 5 segments present, collapser idle
    /// - Retry folds up to 16 and leaves only the newest segment
    #[tokio::test]
    async fn failed_collapse_leaves_state_and_retries() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(
            WalConfig::new(tmp.path().join("tlog"))
                .with_entries_per_segment(4)
                .with_cache_capacity(0),
        )
        .await
        .unwrap();
        let snapshots = Arc::new(SnapshotStore::open(tmp.path().join("db")).await.unwrap());
        for i in 1..=20u64 {
            wal.append(1, Operation::set(format!("k{}", i % 3), i.to_string().into_bytes()))
                .await
                .unwrap();
        }
        let collapser = Collapser::new(wal.clone(), Arc::clone(&snapshots));

        let segment = tmp.path().join("tlog").join("wal.2.log");
        let original = std::fs::read(&segment).unwrap();
        let mut damaged = original.clone();
        if let Some(last) = damaged.last_mut() {
            *last ^= 0xFF;
        }
        std::fs::write(&segment, &damaged).unwrap();

        let err = collapser.collapse(1, 20).await.unwrap_err();
        assert!(
            matches!(err, PersistentStorageError::Gap { expected: 8, found: 9 }),
            "{err:?}"
        );
        assert_eq!(snapshots.up_to_index().await, 0);
        assert_eq!(wal.first_index(), 1);
        assert_eq!(wal.segments().await.len(), 5);
        assert!(!collapser.is_busy());

        std::fs::write(&segment, &original).unwrap();
        let report = collapser.collapse(1, 20).await.unwrap();
        assert_eq!(report.snapshot_up_to, 16);
        assert_eq!(report.removed_segments, 4);
        assert_eq!(wal.first_index(), 17);
        // k1 <- 16, k0 <- 15, k2 <- 14
        let active = snapshots.active().await;
        assert_eq!(active.snapshot.state.get("k1"), Some(&b"16".to_vec()));
        assert_eq!(active.snapshot.state.get("k0"), Some(&b"15".to_vec()));
    }
}
