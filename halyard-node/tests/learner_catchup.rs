//! Learners: bootstrap from a collapsed log, stream new writes, never accept writes

use anyhow::Result;
use halyard_core::{NodeRole, StoreError};
use halyard_node::CatchupState;
use tempfile::TempDir;


use test_utils::{eventually, start_cluster, voters, write_keys, SETTLE};

/// What this test validates
///
/// - A learner joining after the voters collapsed their logs bootstraps from
///   a snapshot, reaches CaughtUp, and then follows new writes
///
/// Scenario
/// - 3 voters with 8-entry segments, 40 writes, collapse everywhere
/// - join `learner` pulling from node_1 then node_2
/// - 10 more writes through the master
///
/// Expectation
/// - the learner reports CaughtUp and serves every key
/// - writes on the learner fail with NotMaster
/// - after a restart the learner still has its keys
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn learner_bootstraps_from_collapsed_log() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(3), |cfg| {
        let cfg = cfg.with_entries_per_segment(8);
        if cfg.node_id == "learner" {
            cfg.with_learner_targets(vec!["node_1".into(), "node_2".into()])
        } else {
            cfg
        }
    })
    .await?;

    write_keys(&cluster, "k/", 0..40).await?;
    for (node, res) in cluster.collapse(1).await {
        res.map_err(|e| anyhow::anyhow!("collapse on {node}: {e}"))?;
    }
    let master = test_utils::wait_for_master(&cluster).await?;
    assert!(master.first_index() > 1, "collapse should drop the log prefix");

    let learner = cluster.add_node("learner", NodeRole::Learner).await?;
    assert!(learner.wait_for_catchup(CatchupState::CaughtUp, SETTLE).await);
    eventually(SETTLE, "learner has every key", || {
        let learner = learner.clone();
        async move { learner.key_count().await.ok() == Some(40) }
    })
    .await?;
    assert_eq!(learner.get("k/00039").await?, b"v39".to_vec());

    assert!(matches!(learner.set("k/x", "nope").await, Err(StoreError::NotMaster(_))));
    assert!(!learner.is_master().await);

    write_keys(&cluster, "late/", 0..10).await?;
    eventually(SETTLE, "learner streams new writes", || {
        let learner = learner.clone();
        async move { learner.key_count().await.ok() == Some(50) }
    })
    .await?;

    let learner = cluster.restart_node("learner").await?;
    assert_eq!(learner.key_count().await?, 50);
    assert!(learner.wait_for_catchup(CatchupState::CaughtUp, SETTLE).await);

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - A learner keeps following when its first source goes away
///
/// Expectation
/// - with node_1 stopped, writes still reach the learner through node_2
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn learner_fails_over_between_sources() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(3), |cfg| {
        if cfg.node_id == "learner" {
            cfg.with_learner_targets(vec!["node_1".into(), "node_2".into()])
        } else {
            cfg
        }
    })
    .await?;

    write_keys(&cluster, "a/", 0..5).await?;
    let learner = cluster.add_node("learner", NodeRole::Learner).await?;
    assert!(learner.wait_for_catchup(CatchupState::CaughtUp, SETTLE).await);

    cluster.stop_node("node_1").await;
    write_keys(&cluster, "b/", 0..5).await?;
    eventually(SETTLE, "learner follows node_2", || {
        let learner = learner.clone();
        async move { learner.exists("b/00004").await.unwrap_or(false) }
    })
    .await?;
    assert!(learner.wait_for_catchup(CatchupState::CaughtUp, SETTLE).await);

    cluster.stop_all().await;
    Ok(())
}
