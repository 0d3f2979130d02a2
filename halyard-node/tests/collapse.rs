//! Log collapse: mutual exclusion, slowdown and reads during a collapse

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use halyard_core::StoreError;
use halyard_persistent_storage::ChunkHook;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{timeout, Duration, Instant};


use test_utils::{start_cluster, voters, write_keys, SETTLE};

/// Parks the collapse before its first chunk until the test releases it.
struct Gate {
    entered: Notify,
    release: Semaphore,
}

#[async_trait]
impl ChunkHook for Gate {
    async fn before_chunk(&self, _chunk: usize, _next_index: u64) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            // one release lets the whole collapse through
            permit.forget();
            self.release.add_permits(1);
        }
    }
}

/// What this test validates
///
/// - Only one collapse runs per node; a second request fails at once instead
///   of queueing, and reads keep working while the first one is parked
///
/// Scenario
/// - single voter, 4-entry segments, 40 writes
/// - a gate hook holds the first collapse before its first chunk
///
/// Expectation
/// - the second collapse returns CollapseInProgress well before the gate opens
/// - reads succeed during the collapse; once released the first collapse
///   finishes and the log prefix is gone
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_collapse_is_rejected() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg.with_entries_per_segment(4)).await?;
    write_keys(&cluster, "k/", 0..40).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    let gate = Arc::new(Gate {
        entered: Notify::new(),
        release: Semaphore::new(0),
    });
    node.set_collapse_hook(gate.clone()).await;

    let first = tokio::spawn({
        let node = node.clone();
        async move { node.collapse(1).await }
    });
    timeout(SETTLE, gate.entered.notified()).await?;
    assert!(node.is_collapsing());

    let started = Instant::now();
    let err = node.collapse(1).await.unwrap_err();
    assert_eq!(err, StoreError::CollapseInProgress);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(node.get("k/00007").await?, b"v7".to_vec());
    node.set("during", "collapse").await?;

    gate.release.add_permits(1);
    let report = first.await??;
    assert!(report.removed_segments > 0);
    assert!(!node.is_collapsing());
    assert!(node.first_index() > 1);
    assert_eq!(node.key_count().await?, 41);

    // the flag is free again
    node.set_collapse_slowdown(None).await;
    node.collapse(1).await?;

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - The collapse slowdown delays each chunk; zero means no delay
///
/// Expectation
/// - a collapse with a 20ms slowdown over several chunks takes measurably longer
///   than the configured delay; a zero slowdown leaves state intact
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slowdown_delays_each_chunk() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg.with_entries_per_segment(4)).await?;
    write_keys(&cluster, "k/", 0..20).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    node.set_collapse_slowdown(Some(Duration::from_millis(20))).await;
    let started = Instant::now();
    let report = node.collapse(1).await?;
    assert!(report.chunks >= 1);
    assert!(started.elapsed() >= Duration::from_millis(20) * report.chunks as u32);

    write_keys(&cluster, "more/", 0..20).await?;
    node.set_collapse_slowdown(Some(Duration::ZERO)).await;
    node.collapse(1).await?;
    assert_eq!(node.key_count().await?, 40);

    cluster.stop_all().await;
    Ok(())
}
