//! Crash recovery of interrupted snapshots on engine restart

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use gridsnap::cache::{CacheEngine, LocalCacheEngine};
use gridsnap::cluster::{ClusterService, LocalCluster};
use gridsnap::config::SnapshotConfig;
use gridsnap::engine::SnapshotEngine;
use gridsnap::layout;
use gridsnap::metastore::{MetaStore, SNAPSHOT_IN_PROGRESS_KEY};
use gridsnap::page::PartitionId;

use common::PS;

/// Lay out the debris of a node that died between START and END:
/// marker set, snapshot directory half-written, temp deltas on disk.
fn plant_crash_debris(base: &std::path::Path) {
    let metastore = MetaStore::open(&base.join("work")).unwrap();
    metastore.put(SNAPSHOT_IN_PROGRESS_KEY, "s1").unwrap();

    let snap = base.join("snapshots").join("s1").join("db").join("node-0").join("default");
    fs::create_dir_all(&snap).unwrap();
    fs::write(snap.join("part-0.bin"), vec![0u8; PS]).unwrap();

    let tmp = base
        .join("work")
        .join(layout::TMP_SNAPSHOT_DIR)
        .join("s1")
        .join("db")
        .join("node-0")
        .join("default");
    fs::create_dir_all(&tmp).unwrap();
    fs::write(tmp.join("part-0.bin.delta"), vec![0u8; PS]).unwrap();
}

fn start_engine(cluster: &LocalCluster, base: &std::path::Path) -> SnapshotEngine {
    let cache = Arc::new(LocalCacheEngine::new(base, "node-0", PS).unwrap());
    cache.create_group(1, "default", &["people"], 2).unwrap();
    cache.put_page(PartitionId::new(1, 0), 0, b"live data").unwrap();

    let cfg = SnapshotConfig::new(base)
        .with_page_size(PS)
        .with_transfer_timeout(Duration::from_secs(5));
    let (svc, events) = cluster.join();
    SnapshotEngine::start(cfg, cache as Arc<dyn CacheEngine>, svc as Arc<dyn ClusterService>, events)
        .unwrap()
}

#[tokio::test]
async fn interrupted_snapshot_cleaned_on_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    plant_crash_debris(dir.path());

    let cluster = LocalCluster::new();
    let engine = start_engine(&cluster, dir.path());

    // The interrupted snapshot and temp work are gone.
    assert!(!dir.path().join("snapshots").join("s1").exists());
    let tmp = dir.path().join("work").join(layout::TMP_SNAPSHOT_DIR);
    assert!(!tmp.exists() || fs::read_dir(&tmp).unwrap().count() == 0);

    // The marker is cleared and the snapshot is not listed.
    let metastore = MetaStore::open(&dir.path().join("work")).unwrap();
    assert_eq!(metastore.get(SNAPSHOT_IN_PROGRESS_KEY), None);
    assert!(engine.get_snapshots().unwrap().is_empty());
}

#[tokio::test]
async fn restart_twice_is_noop() {
    let dir = tempfile::TempDir::new().unwrap();
    plant_crash_debris(dir.path());

    let cluster = LocalCluster::new();
    let _first = start_engine(&cluster, dir.path());

    // A second restart over the already-recovered state changes nothing
    // and starts cleanly.
    let cluster2 = LocalCluster::new();
    let engine = start_engine(&cluster2, dir.path());

    assert!(!dir.path().join("snapshots").join("s1").exists());
    assert!(engine.get_snapshots().unwrap().is_empty());
}

#[tokio::test]
async fn completed_snapshots_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let cluster = LocalCluster::new();
    let engine = start_engine(&cluster, dir.path());
    engine.create_snapshot("keep-me").unwrap().await.unwrap();

    // Restart: the completed snapshot is still listed, nothing deleted.
    let cluster2 = LocalCluster::new();
    let engine2 = start_engine(&cluster2, dir.path());
    assert_eq!(engine2.get_snapshots().unwrap(), vec!["keep-me".to_string()]);
    engine2.check_snapshot("keep-me").unwrap();
}

#[tokio::test]
async fn snapshot_after_recovery_reuses_name() {
    let dir = tempfile::TempDir::new().unwrap();
    plant_crash_debris(dir.path());

    let cluster = LocalCluster::new();
    let engine = start_engine(&cluster, dir.path());

    // The crashed name is free again after recovery.
    engine.create_snapshot("s1").unwrap().await.unwrap();
    assert_eq!(engine.get_snapshots().unwrap(), vec!["s1".to_string()]);
    engine.check_snapshot("s1").unwrap();
}
