//! Operation statistics and storage utilization reports

use anyhow::Result;
use halyard_core::OpCategory;
use tempfile::TempDir;


use test_utils::{eventually, start_cluster, voters, write_keys, SETTLE};

/// What this test validates
///
/// - Every category starts empty, counts each call once, and reset clears
///   the timings but not the per-node log positions
///
/// Expectation
/// - n == 0 and min None before any operation
/// - after 3 sets, 2 gets and 1 delete the counts match and min <= avg <= max
/// - the master reports itself and both followers in node_is
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn statistics_track_each_category() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(3), |cfg| cfg).await?;
    let master = test_utils::wait_for_master(&cluster).await?;

    master.reset_statistics().await;
    let empty = master.statistics().await;
    for (_, timing) in empty.iter() {
        assert_eq!(timing.n, 0);
        assert_eq!(timing.min, None);
    }

    for key in ["a", "b", "c"] {
        master.set(key, "x").await?;
    }
    master.get("a").await?;
    let _ = master.get("missing").await;
    master.delete("b").await?;

    let stats = master.statistics().await;
    assert_eq!(stats.timing(OpCategory::Set).n, 3);
    assert_eq!(stats.timing(OpCategory::Get).n, 2);
    assert_eq!(stats.timing(OpCategory::Delete).n, 1);
    assert_eq!(stats.timing(OpCategory::Sequence).n, 0);

    let set = stats.timing(OpCategory::Set);
    let min = set.min.unwrap_or_default();
    assert!(min <= set.avg && set.avg <= set.max);
    assert!(set.var >= 0.0);
    assert!(stats.start <= stats.last);

    assert!(stats.node_is.contains_key(master.id()));
    assert_eq!(stats.node_is.get(master.id()), Some(&master.last_index()));
    eventually(SETTLE, "followers in node_is", || {
        let master = master.clone();
        async move { master.statistics().await.node_is.len() == 3 }
    })
    .await?;

    master.reset_statistics().await;
    let stats = master.statistics().await;
    assert_eq!(stats.timing(OpCategory::Set).n, 0);
    assert_eq!(stats.node_is.len(), 3);

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - Storage utilization covers log, WAL and snapshot files, and the cluster
///   total is the sum of the per-node reports
///
/// Expectation
/// - WAL usage is non-zero after writes; snapshot usage appears after a collapse
/// - total == sum over nodes, field by field
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn utilization_sums_over_nodes() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(3), |cfg| cfg.with_entries_per_segment(8)).await?;
    write_keys(&cluster, "k/", 0..30).await?;

    let master = test_utils::wait_for_master(&cluster).await?;
    let before = master.storage_utilization().await?;
    assert!(before.tlog > 0);

    master.collapse(1).await?;
    let after = master.storage_utilization().await?;
    assert!(after.db > 0);

    let report = cluster.utilization().await?;
    assert_eq!(report.nodes.len(), 3);
    let total = report.total();
    assert_eq!(total.log, report.nodes.values().map(|u| u.log).sum::<u64>());
    assert_eq!(total.tlog, report.nodes.values().map(|u| u.tlog).sum::<u64>());
    assert_eq!(total.db, report.nodes.values().map(|u| u.db).sum::<u64>());
    assert_eq!(
        total.total(),
        report.nodes.values().map(|u| u.total()).sum::<u64>()
    );

    cluster.stop_all().await;
    Ok(())
}
