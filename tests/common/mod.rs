//! Shared harness for snapshot engine integration tests
//!
//! Builds an in-process cluster of engines, each with its own temp
//! directory, file-backed cache engine and snapshot configuration.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gridsnap::cache::{CacheEngine, LocalCacheEngine};
use gridsnap::cluster::{ClusterService, LocalCluster, NodeId};
use gridsnap::config::SnapshotConfig;
use gridsnap::engine::SnapshotEngine;
use gridsnap::page::DEFAULT_PAGE_SIZE;

pub const PS: usize = DEFAULT_PAGE_SIZE;

/// Opt-in log output for debugging test runs (`RUST_LOG=debug`).
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub struct TestNode {
    pub dir: TempDir,
    pub cache: Arc<LocalCacheEngine>,
    pub engine: SnapshotEngine,
    pub id: NodeId,
}

impl TestNode {
    pub fn snapshot_root(&self) -> std::path::PathBuf {
        self.dir.path().join("snapshots")
    }
}

/// Spin up `nodes` engines in one loopback cluster, each with `groups`
/// cache groups of `partitions` partitions named `grp-<id>` (the first
/// group is named `default`).
pub fn spawn_cluster(
    cluster: &LocalCluster,
    nodes: usize,
    groups: i32,
    partitions: u32,
) -> Vec<TestNode> {
    let mut out = Vec::new();

    for n in 0..nodes {
        let dir = TempDir::new().unwrap();
        let node_folder = format!("node-{}", n);

        let cache = Arc::new(LocalCacheEngine::new(dir.path(), &node_folder, PS).unwrap());
        for g in 1..=groups {
            let name = if g == 1 { "default".to_string() } else { format!("grp-{}", g) };
            cache
                .create_group(g, &name, &[&format!("cache-{}", g)], partitions)
                .unwrap();
        }

        let cfg = SnapshotConfig::new(dir.path())
            .with_page_size(PS)
            .with_transfer_timeout(Duration::from_secs(5));

        let (svc, events) = cluster.join();
        let id = svc.local_node();
        let engine = SnapshotEngine::start(
            cfg,
            cache.clone() as Arc<dyn CacheEngine>,
            svc as Arc<dyn ClusterService>,
            events,
        )
        .unwrap();

        out.push(TestNode { dir, cache, engine, id });
    }

    out
}
