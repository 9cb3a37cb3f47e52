/// Replica manager lifecycle tests
///
/// Swap protocol, sequence contract and retirement behavior against both the
/// on-disk snapshot engine and the in-memory mock engine.
/// Run with: cargo test --test replica_manager_tests

mod common;

use common::{MockEngine, batch};
use omreplica::core::{TableData, Tables};
use omreplica::storage::persistence::MANIFEST_FILE;
use omreplica::storage::write_location;
use omreplica::{
    ReplicaConfig, ReplicaError, ReplicaManager, ReplicaPhase, SnapshotStoreEngine, WriteBatch,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn seed(root: &Path, name: &str, sequence: u64) -> PathBuf {
    let location = root.join(name);
    let mut volumes = TableData::new();
    volumes.insert(format!("/{}", name), b"volume".to_vec());
    let mut tables = Tables::new();
    tables.insert("volumeTable".to_string(), volumes);
    write_location(&location, &tables, sequence).unwrap();
    location
}

fn disk_manager() -> ReplicaManager {
    ReplicaManager::new(Arc::new(SnapshotStoreEngine::new()), ReplicaConfig::default()).unwrap()
}

#[tokio::test]
async fn test_refresh_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 120);
    let b = seed(temp_dir.path(), "om.snapshot.db_b", 150);
    let c = temp_dir.path().join("om.snapshot.db_c");
    fs::create_dir(&c).unwrap();
    fs::write(c.join(MANIFEST_FILE), b"{ not json").unwrap();

    let manager = disk_manager();
    manager.initialize(&a).await.unwrap();
    assert_eq!(manager.last_sequence_number().await.unwrap(), 120);

    manager.update_location(&b).await.unwrap();
    assert_eq!(manager.last_sequence_number().await.unwrap(), 150);
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();

    let err = manager.update_location(&c).await.unwrap_err();
    assert!(matches!(err, ReplicaError::OpenFailure { .. }));
    assert!(err.is_retryable());
    assert_eq!(manager.last_sequence_number().await.unwrap(), 150);
    assert_eq!(manager.active_location().await.unwrap(), fs::canonicalize(&b).unwrap());

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.phase, ReplicaPhase::Active);
    assert_eq!(stats.swaps, 2);
    assert_eq!(stats.failed_swaps, 1);
    assert_eq!(stats.handles_opened, 2);
    assert_eq!(stats.handles_closed, 1);
    assert_eq!(stats.retired_handles, 1);
    assert_eq!(stats.pending_retirements, 0);
    assert!(stats.active_since.is_some());
}

#[tokio::test]
async fn test_not_ready_is_not_zero() {
    let manager = disk_manager();
    let err = manager.last_sequence_number().await.unwrap_err();
    assert!(matches!(err, ReplicaError::NotInitialized));
    assert!(!err.is_retryable());
    assert_err!(manager.tables_initialized().await);
}

#[tokio::test]
async fn test_zero_sequence_is_valid_once_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let empty = temp_dir.path().join("om.snapshot.db_empty");
    write_location(&empty, &Tables::new(), 0).unwrap();

    let manager = ReplicaManager::open(
        Arc::new(SnapshotStoreEngine::new()),
        ReplicaConfig::default(),
        &empty,
    )
    .await
    .unwrap();
    assert_eq!(manager.last_sequence_number().await.unwrap(), 0);
    assert!(!manager.tables_initialized().await.unwrap());
}

#[tokio::test]
async fn test_failed_initialize_stays_uninitialized() {
    let temp_dir = TempDir::new().unwrap();
    let manager = disk_manager();

    let err = manager
        .initialize(temp_dir.path().join("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaError::OpenFailure { .. }));
    assert_eq!(manager.phase().await, ReplicaPhase::Uninitialized);

    let a = seed(temp_dir.path(), "om.snapshot.db_a", 7);
    assert_ok!(manager.initialize(&a).await);
    assert_eq!(manager.last_sequence_number().await.unwrap(), 7);
}

#[tokio::test]
async fn test_lease_keeps_retired_handle_readable() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 10);
    let b = seed(temp_dir.path(), "om.snapshot.db_b", 20);

    let manager = disk_manager();
    manager.initialize(&a).await.unwrap();

    let lease = manager.lease().await.unwrap();
    manager.update_location(&b).await.unwrap();

    // the old lease still reads the old snapshot
    assert_eq!(lease.sequence_number().unwrap(), 10);
    assert_eq!(
        lease.get("volumeTable", "/om.snapshot.db_a").unwrap(),
        Some(b"volume".to_vec())
    );
    assert_eq!(manager.last_sequence_number().await.unwrap(), 20);
    assert_eq!(manager.retirement_report().unwrap().pending, 1);

    let timeout = manager
        .await_retirement(Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(timeout, ReplicaError::RetirementTimeout { pending: 1 }));

    drop(lease);
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert_eq!(manager.stats().await.unwrap().handles_closed, 1);
}

#[tokio::test]
async fn test_retired_locations_are_removed_when_configured() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 1);
    let b = seed(temp_dir.path(), "om.snapshot.db_b", 2);
    let c = seed(temp_dir.path(), "om.snapshot.db_c", 3);

    let config = ReplicaConfig::new().remove_retired_locations(true);
    let manager = ReplicaManager::open(Arc::new(SnapshotStoreEngine::new()), config, &a)
        .await
        .unwrap();

    let lease = manager.lease().await.unwrap();
    manager.update_location(&b).await.unwrap();
    assert!(a.exists(), "leased location must survive until released");

    drop(lease);
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert!(!a.exists());

    manager.update_location(&c).await.unwrap();
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert!(!b.exists());

    // the active location is kept on shutdown
    manager.shutdown().await.unwrap();
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert!(c.exists());
}

#[tokio::test]
async fn test_incremental_updates_then_full_refresh() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 100);
    let b = seed(temp_dir.path(), "om.snapshot.db_b", 40);

    let manager = disk_manager();
    manager.initialize(&a).await.unwrap();

    let applied = manager
        .apply_updates(
            &WriteBatch::new(101)
                .put("bucketTable", "/vol/bucket1", b"b1".to_vec())
                .put("keyTable", "/vol/bucket1/key1", b"k1".to_vec()),
        )
        .await
        .unwrap();
    assert_eq!(applied, 102);
    assert_eq!(manager.last_sequence_number().await.unwrap(), 102);
    assert!(manager.tables_initialized().await.unwrap());

    let gap = manager.apply_updates(&batch(110, 1)).await.unwrap_err();
    assert!(matches!(gap, ReplicaError::SequenceGap { expected: 103, found: 110 }));
    assert!(gap.is_retryable());
    assert_eq!(manager.last_sequence_number().await.unwrap(), 102);

    // the new snapshot's history is independent of the old one
    manager.update_location(&b).await.unwrap();
    assert_eq!(manager.last_sequence_number().await.unwrap(), 40);
}

#[tokio::test]
async fn test_checkpoint_of_active_handle_can_be_swapped_in() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 5);
    let manager = disk_manager();
    manager.initialize(&a).await.unwrap();
    manager.apply_updates(&batch(6, 3)).await.unwrap();

    let checkpoint = temp_dir.path().join("om.snapshot.db_checkpoint");
    manager.checkpoint_to(&checkpoint).await.unwrap();
    manager.update_location(&checkpoint).await.unwrap();

    assert_eq!(manager.last_sequence_number().await.unwrap(), 8);
    let lease = manager.lease().await.unwrap();
    assert_eq!(lease.row_count("keyTable").unwrap(), 3);
    assert_eq!(lease.list_tables().unwrap(), vec!["keyTable", "volumeTable"]);
}

#[tokio::test]
async fn test_no_leak_after_many_swaps() {
    let engine = MockEngine::new();
    let first = engine.add_location("loc-0", 0);
    let manager = ReplicaManager::open(engine.clone(), ReplicaConfig::default(), &first)
        .await
        .unwrap();

    let mut last = first;
    for i in 1..=10u64 {
        last = engine.add_location(&format!("loc-{}", i), i * 100);
        manager.update_location(&last).await.unwrap();
    }
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();

    assert_eq!(engine.open_count(), 11);
    assert_eq!(engine.still_open(), vec![last]);
    assert_eq!(manager.last_sequence_number().await.unwrap(), 1000);

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.handles_closed, 10);
    assert!(manager.retirement_report().unwrap().is_quiescent());
}

#[tokio::test]
async fn test_close_failure_does_not_block_publication() {
    let engine = MockEngine::new();
    let a = engine.add_failing_close("loc-a", 3);
    let b = engine.add_location("loc-b", 9);

    let manager = ReplicaManager::open(engine.clone(), ReplicaConfig::default(), &a)
        .await
        .unwrap();
    assert_ok!(manager.update_location(&b).await);

    assert_eq!(manager.last_sequence_number().await.unwrap(), 9);
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert_eq!(engine.still_open(), vec![b]);
}

#[tokio::test]
async fn test_leak_report_names_held_handle() {
    let engine = MockEngine::new();
    let a = engine.add_location("loc-a", 1);
    let b = engine.add_location("loc-b", 2);

    let config = ReplicaConfig::new().leak_threshold(Duration::from_millis(1));
    let manager = ReplicaManager::open(engine.clone(), config, &a).await.unwrap();

    let forgotten = manager.lease().await.unwrap();
    manager.update_location(&b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = manager.retirement_report().unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.suspected_leaks.len(), 1);
    assert_eq!(report.suspected_leaks[0].handle_id, forgotten.handle_id());
    assert_eq!(report.suspected_leaks[0].location, a);

    drop(forgotten);
    assert!(manager.retirement_report().unwrap().suspected_leaks.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_last_handle_after_readers() {
    let engine = MockEngine::new();
    let a = engine.add_location("loc-a", 1);
    let manager = ReplicaManager::open(engine.clone(), ReplicaConfig::default(), &a)
        .await
        .unwrap();

    let lease = manager.lease().await.unwrap();
    manager.shutdown().await.unwrap();
    assert!(matches!(
        manager.last_sequence_number().await,
        Err(ReplicaError::AlreadyClosed)
    ));

    // an in-flight reader finishes against the unpublished handle
    assert_eq!(lease.sequence_number().unwrap(), 1);
    assert_eq!(engine.still_open(), vec![a]);

    drop(lease);
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert!(engine.still_open().is_empty());
}

#[tokio::test]
async fn test_sequence_limit_is_an_error_not_a_panic() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 5);
    let near_limit = seed(temp_dir.path(), "om.snapshot.db_limit", u64::MAX - 1);
    let manager = disk_manager();
    manager.initialize(&a).await.unwrap();

    let far_ahead = WriteBatch::new(u64::MAX)
        .put("keyTable", "k1", b"1".to_vec())
        .put("keyTable", "k2", b"2".to_vec());
    let err = manager.apply_updates(&far_ahead).await.unwrap_err();
    assert!(matches!(err, ReplicaError::SequenceGap { expected: 6, found: u64::MAX }));

    manager.update_location(&near_limit).await.unwrap();
    let err = manager.apply_updates(&far_ahead).await.unwrap_err();
    assert!(matches!(err, ReplicaError::SequenceOverflow { start: u64::MAX, ops: 2 }));
    assert!(!err.is_retryable());
    assert_eq!(manager.last_sequence_number().await.unwrap(), u64::MAX - 1);

    let last = WriteBatch::new(u64::MAX).put("keyTable", "k1", b"1".to_vec());
    assert_eq!(manager.apply_updates(&last).await.unwrap(), u64::MAX);
    let err = manager.apply_updates(&last).await.unwrap_err();
    assert!(matches!(err, ReplicaError::SequenceGap { .. }));
    assert_eq!(manager.last_sequence_number().await.unwrap(), u64::MAX);

    // the journal holding the final batch still reopens
    manager.update_location(&a).await.unwrap();
    manager.update_location(&near_limit).await.unwrap();
    assert_eq!(manager.last_sequence_number().await.unwrap(), u64::MAX);
}

#[tokio::test]
async fn test_alias_of_active_location_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 10);
    fs::create_dir(temp_dir.path().join("sub")).unwrap();
    let alias = temp_dir.path().join("sub").join("..").join("om.snapshot.db_a");

    let config = ReplicaConfig::new().remove_retired_locations(true);
    let manager = ReplicaManager::open(Arc::new(SnapshotStoreEngine::new()), config, &a)
        .await
        .unwrap();

    let err = manager.update_location(&alias).await.unwrap_err();
    assert!(matches!(err, ReplicaError::InvalidLocation(_)));
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();

    assert!(a.exists());
    assert_eq!(manager.stats().await.unwrap().failed_swaps, 0);
    assert_eq!(manager.apply_updates(&batch(11, 1)).await.unwrap(), 11);
}

#[tokio::test]
async fn test_republished_location_survives_old_lease() {
    let temp_dir = TempDir::new().unwrap();
    let a = seed(temp_dir.path(), "om.snapshot.db_a", 10);
    let b = seed(temp_dir.path(), "om.snapshot.db_b", 20);
    let c = seed(temp_dir.path(), "om.snapshot.db_c", 30);

    let config = ReplicaConfig::new().remove_retired_locations(true);
    let manager = ReplicaManager::open(Arc::new(SnapshotStoreEngine::new()), config, &a)
        .await
        .unwrap();

    let old_a = manager.lease().await.unwrap();
    manager.update_location(&b).await.unwrap();
    manager.update_location(&a).await.unwrap();
    assert_err!(manager.await_retirement(Duration::from_millis(30)).await);
    assert!(!b.exists());

    // releasing the first handle on `a` must not remove it: it is active again
    drop(old_a);
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert!(a.exists());
    assert_eq!(manager.apply_updates(&batch(11, 2)).await.unwrap(), 12);

    // once nothing holds it, a retired `a` goes away as configured
    manager.update_location(&c).await.unwrap();
    manager.await_retirement(Duration::from_secs(5)).await.unwrap();
    assert!(!a.exists());
    assert!(c.exists());
}
