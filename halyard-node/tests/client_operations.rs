//! Client operations on a single-voter cluster: sequences, asserts and reads

use anyhow::Result;
use halyard_core::{Operation, StoreError};
use tempfile::TempDir;


use test_utils::{start_cluster, voters};

/// What this test validates
///
/// - A sequence is all-or-nothing: a failing assert anywhere in the batch
///   leaves every key untouched and logs nothing
///
/// Scenario
/// - set `a`, then submit [set b, assert a == "wrong", set c]
/// - submit the same batch with the right expectation
///
/// Expectation
/// - first batch fails with AssertionFailed("a"); b and c do not exist and
///   the last log index is unchanged
/// - second batch applies every operation
#[tokio::test]
async fn failed_assert_aborts_the_whole_sequence() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    node.set("a", "1").await?;
    let before = node.last_index();

    let batch = |expected: &str| {
        vec![
            Operation::set("b", "2"),
            Operation::assert("a", Some(expected.as_bytes().to_vec())),
            Operation::set("c", "3"),
        ]
    };

    let err = node.sequence(batch("wrong")).await.unwrap_err();
    assert_eq!(err, StoreError::AssertionFailed("a".into()));
    assert!(!node.exists("b").await?);
    assert!(!node.exists("c").await?);
    assert_eq!(node.last_index(), before);

    node.sequence(batch("1")).await?;
    assert_eq!(node.last_index(), before + 1);
    assert_eq!(node.multi_get(&["a", "b", "c"]).await?, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    // later operations see earlier ones in the same batch
    node.sequence(vec![
        Operation::delete("b"),
        Operation::assert("b", None),
        Operation::set("b", "again"),
    ])
    .await?;
    assert_eq!(node.get("b").await?, b"again".to_vec());

    // an empty batch succeeds and logs nothing
    let last = node.last_index();
    node.sequence(Vec::new()).await?;
    assert_eq!(node.last_index(), last);

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - Compare-and-set through sequences: only the first of two batches that
///   assert the same old value wins
///
/// Expectation
/// - [Assert(k, old), Set(k, changed)] succeeds
/// - [Assert(k, old), Set(k, changed2)] fails with AssertionFailed("k") and
///   k still reads `changed`
#[tokio::test]
async fn second_guarded_sequence_sees_first_write() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    node.set("k", "old").await?;
    let guarded = |value: &str| {
        vec![
            Operation::assert("k", Some(b"old".to_vec())),
            Operation::set("k", value.as_bytes().to_vec()),
        ]
    };

    node.sequence(guarded("changed")).await?;
    let err = node.sequence(guarded("changed2")).await.unwrap_err();
    assert_eq!(err, StoreError::AssertionFailed("k".into()));
    assert_eq!(node.get("k").await?, b"changed".to_vec());

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - Missing keys are reported with the exact key that was asked for
///
/// Expectation
/// - get, delete and multi_get of an absent key fail with KeyNotFound(key)
#[tokio::test]
async fn missing_keys_are_named_in_errors() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    node.set("present", "x").await?;
    let before = node.last_index();

    let err = node.delete("non-existing").await.unwrap_err();
    assert_eq!(err, StoreError::KeyNotFound("non-existing".into()));
    assert_eq!(err.key(), Some("non-existing"));
    assert_eq!(node.last_index(), before);

    assert_eq!(
        node.get("non-existing").await.unwrap_err(),
        StoreError::KeyNotFound("non-existing".into())
    );
    assert_eq!(
        node.multi_get(&["present", "gone"]).await.unwrap_err(),
        StoreError::KeyNotFound("gone".into())
    );

    node.delete("present").await?;
    assert!(!node.exists("present").await?);

    // a fresh key goes through a normal cycle afterwards
    node.set("fresh", "1").await?;
    assert_eq!(node.get("fresh").await?, b"1".to_vec());
    node.delete("fresh").await?;
    assert!(!node.exists("fresh").await?);

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - Values above the configured ceiling are refused before they reach the log
///
/// Expectation
/// - set and sequence both fail with ValueTooLarge; last index unchanged;
///   a value exactly at the ceiling is accepted
#[tokio::test]
async fn oversized_values_are_rejected() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg.with_max_value_size(64)).await?;
    let node = test_utils::wait_for_master(&cluster).await?;
    node.set("warmup", "x").await?;
    let before = node.last_index();

    let err = node.set("big", vec![0u8; 65]).await.unwrap_err();
    assert_eq!(err, StoreError::ValueTooLarge { size: 65, limit: 64 });

    let err = node
        .sequence(vec![Operation::set("small", "ok"), Operation::set("big", vec![1u8; 100])])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ValueTooLarge { size: 100, .. }));
    assert_eq!(node.last_index(), before);
    assert!(!node.exists("small").await?);

    node.set("edge", vec![7u8; 64]).await?;
    assert_eq!(node.get("edge").await?.len(), 64);

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - test_and_set swaps only on a match and always reports the value it found
///
/// Expectation
/// - create-if-absent, compare-and-swap, failed swap and compare-and-delete
///   behave as described
#[tokio::test]
async fn test_and_set_swaps_on_match_only() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    assert_eq!(node.test_and_set("t", None, Some(b"1".to_vec())).await?, None);
    assert_eq!(node.get("t").await?, b"1".to_vec());

    let last = node.last_index();
    let found = node.test_and_set("t", Some(b"other"), Some(b"2".to_vec())).await?;
    assert_eq!(found, Some(b"1".to_vec()));
    assert_eq!(node.get("t").await?, b"1".to_vec());
    assert_eq!(node.last_index(), last);

    let found = node.test_and_set("t", Some(b"1"), Some(b"2".to_vec())).await?;
    assert_eq!(found, Some(b"1".to_vec()));
    assert_eq!(node.get("t").await?, b"2".to_vec());

    node.test_and_set("t", Some(b"2"), None).await?;
    assert!(!node.exists("t").await?);

    node.assert("t", None).await?;
    assert_eq!(
        node.assert("t", Some(b"2".to_vec())).await.unwrap_err(),
        StoreError::AssertionFailed("t".into())
    );

    cluster.stop_all().await;
    Ok(())
}

/// What this test validates
///
/// - Range and prefix scans return keys in order, honour bounds and limits
#[tokio::test]
async fn range_and_prefix_scans() -> Result<()> {
    let tmp = TempDir::new()?;
    let cluster = start_cluster(tmp.path(), voters(1), |cfg| cfg).await?;
    let node = test_utils::wait_for_master(&cluster).await?;

    let ops = ["a", "b/1", "b/2", "b/3", "c"]
        .iter()
        .map(|k| Operation::set(*k, k.as_bytes().to_vec()))
        .collect();
    node.sequence(ops).await?;
    assert_eq!(node.key_count().await?, 5);

    let keys = |pairs: Vec<(String, Vec<u8>)>| pairs.into_iter().map(|(k, _)| k).collect::<Vec<_>>();

    assert_eq!(
        keys(node.range(Some("b/1"), true, Some("b/3"), false, None).await?),
        vec!["b/1", "b/2"]
    );
    assert_eq!(
        keys(node.range(Some("a"), false, None, true, Some(2)).await?),
        vec!["b/1", "b/2"]
    );
    assert_eq!(keys(node.range(None, true, None, true, None).await?).len(), 5);

    assert_eq!(node.prefix_keys("b/", None).await?, vec!["b/1", "b/2", "b/3"]);
    assert_eq!(node.prefix_keys("b/", Some(1)).await?, vec!["b/1"]);
    assert!(node.prefix_keys("z", None).await?.is_empty());

    cluster.stop_all().await;
    Ok(())
}
