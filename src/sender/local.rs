//! Local snapshot sink
//!
//! Writes the snapshot into `<snapRoot>/<snapName>/db/<nodeFolder>/` on
//! the local node. `init` records the "snapshot in progress" marker in
//! the metastore atomically under the checkpoint read lock; a close with
//! an error deletes the partial snapshot directory tree. Deltas are
//! applied to the just-copied partition immediately, so a completed
//! local snapshot contains only clean partition files.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Poison, SnapshotSender};
use crate::cache::CacheEngine;
use crate::delta::apply_delta;
use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout::{
    self, SnapshotMeta, BINARY_META_DIR, MARSHALLER_DIR,
};
use crate::metastore::{MetaStore, SNAPSHOT_IN_PROGRESS_KEY};
use crate::page::PartitionId;
use crate::pagestore::PartitionPageStore;

/// Sink that lays a snapshot out on the local node.
pub struct LocalSink {
    name: String,
    snapshot_dir: PathBuf,
    node_db_dir: PathBuf,
    page_size: usize,
    cache: Arc<dyn CacheEngine>,
    metastore: Arc<MetaStore>,
    poison: Arc<Poison>,
    baseline: Vec<String>,
    closed: AtomicBool,
}

impl LocalSink {
    /// Create a sink for one named snapshot.
    pub fn new(
        name: &str,
        snapshot_root: &Path,
        cache: Arc<dyn CacheEngine>,
        metastore: Arc<MetaStore>,
        poison: Arc<Poison>,
        baseline: Vec<String>,
    ) -> Self {
        let snapshot_dir = layout::snapshot_dir(snapshot_root, name);
        let node_db_dir = layout::node_db_dir(snapshot_root, name, &cache.node_folder());
        let page_size = cache.page_size();
        Self {
            name: name.to_string(),
            snapshot_dir,
            node_db_dir,
            page_size,
            cache,
            metastore,
            poison,
            baseline,
            closed: AtomicBool::new(false),
        }
    }

    /// Directory this sink writes into.
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    fn run<T>(&self, op: impl FnOnce() -> SnapshotResult<T>) -> SnapshotResult<T> {
        self.poison.check()?;
        op().map_err(|err| self.poison.poison(err))
    }

    fn group_dir(&self, cache_dir: &str) -> SnapshotResult<PathBuf> {
        let dir = layout::group_dir(&self.node_db_dir, cache_dir);
        fs::create_dir_all(&dir).map_err(|e| SnapshotError::storage(dir.display(), e))?;
        Ok(dir)
    }

    fn write_metadata(&self, dir_name: &str, file_name: &str, bytes: &[u8]) -> SnapshotResult<()> {
        let dir = self.snapshot_dir.join(dir_name);
        fs::create_dir_all(&dir).map_err(|e| SnapshotError::storage(dir.display(), e))?;

        let path = dir.join(file_name);
        let mut file = File::create(&path).map_err(|e| SnapshotError::storage(path.display(), e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| SnapshotError::storage(path.display(), e))
    }
}

/// Copy at most `len` bytes of `src` to `dst` with fsync.
fn copy_len_with_fsync(src: &Path, dst: &Path, len: u64) -> SnapshotResult<()> {
    let mut src_file = File::open(src).map_err(|e| SnapshotError::storage(src.display(), e))?;
    let mut dst_file = File::create(dst).map_err(|e| SnapshotError::storage(dst.display(), e))?;

    let mut remaining = len;
    let mut buffer = [0u8; 8192];
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let got = src_file
            .read(&mut buffer[..want])
            .map_err(|e| SnapshotError::storage(src.display(), e))?;
        if got == 0 {
            return Err(SnapshotError::StorageFailed(format!(
                "{} ended {} bytes short of the boundary size",
                src.display(),
                remaining
            )));
        }
        dst_file
            .write_all(&buffer[..got])
            .map_err(|e| SnapshotError::storage(dst.display(), e))?;
        remaining -= got as u64;
    }

    dst_file.sync_all().map_err(|e| SnapshotError::storage(dst.display(), e))
}

fn fsync_dir(path: &Path) -> SnapshotResult<()> {
    let dir = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| SnapshotError::storage(path.display(), e))?;
    dir.sync_all().map_err(|e| SnapshotError::storage(path.display(), e))
}

impl SnapshotSender for LocalSink {
    fn init(&self, total_parts: u32) -> SnapshotResult<()> {
        self.run(|| {
            // The marker moves atomically with respect to checkpoint
            // activity: crash recovery relies on it to find interrupted
            // snapshots.
            {
                let _cp = self.cache.checkpoint_lock().read().expect("checkpoint lock poisoned");
                self.metastore.put(SNAPSHOT_IN_PROGRESS_KEY, &self.name)?;
            }

            fs::create_dir_all(&self.node_db_dir)
                .map_err(|e| SnapshotError::storage(self.node_db_dir.display(), e))?;

            debug!(name = %self.name, total_parts, "local snapshot sink initialized");
            Ok(())
        })
    }

    fn send_cache_config(&self, cfg_file: &Path, cache_dir: &str) -> SnapshotResult<()> {
        self.run(|| {
            let dir = self.group_dir(cache_dir)?;
            let file_name = cfg_file.file_name().ok_or_else(|| {
                SnapshotError::StorageFailed(format!(
                    "cache config has no file name: {}",
                    cfg_file.display()
                ))
            })?;
            let len = fs::metadata(cfg_file)
                .map_err(|e| SnapshotError::storage(cfg_file.display(), e))?
                .len();
            copy_len_with_fsync(cfg_file, &dir.join(file_name), len)
        })
    }

    fn send_type_metadata(&self, types: &[u8]) -> SnapshotResult<()> {
        self.run(|| self.write_metadata(BINARY_META_DIR, "types.json", types))
    }

    fn send_mapping_metadata(&self, mappings: &[u8]) -> SnapshotResult<()> {
        self.run(|| self.write_metadata(MARSHALLER_DIR, "mappings.json", mappings))
    }

    fn send_part(
        &self,
        file: &Path,
        cache_dir: &str,
        partition: PartitionId,
        len: u64,
    ) -> SnapshotResult<()> {
        self.run(|| {
            let dir = self.group_dir(cache_dir)?;
            let dst = dir.join(layout::partition_file_name(partition));
            copy_len_with_fsync(file, &dst, len)?;
            debug!(name = %self.name, %partition, len, "partition copied");
            Ok(())
        })
    }

    fn send_delta(
        &self,
        delta_file: &Path,
        cache_dir: &str,
        partition: PartitionId,
    ) -> SnapshotResult<()> {
        self.run(|| {
            let dir = layout::group_dir(&self.node_db_dir, cache_dir);
            let part_path = dir.join(layout::partition_file_name(partition));

            let mut store = PartitionPageStore::open(&part_path, partition, self.page_size)?;
            let pages = apply_delta(&mut store, delta_file)?;
            debug!(name = %self.name, %partition, size = pages, "delta applied to copy");
            Ok(())
        })
    }

    fn close(&self, error: Option<&SnapshotError>) -> SnapshotResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            warn!(name = %self.name, "local sink closed twice");
            return Ok(());
        }

        match error {
            None => {
                let meta = SnapshotMeta {
                    name: self.name.clone(),
                    node_folder: self.cache.node_folder(),
                    page_size: self.page_size,
                    baseline: self.baseline.clone(),
                    created_at: Utc::now().to_rfc3339(),
                };
                meta.write(&self.snapshot_dir)?;
                fsync_dir(&self.snapshot_dir)?;
                info!(name = %self.name, "local snapshot written");
                Ok(())
            }
            Some(err) => {
                // Incomplete output must not survive: the directory is
                // the unit of consistency.
                if self.snapshot_dir.exists() {
                    if let Err(rm) = fs::remove_dir_all(&self.snapshot_dir) {
                        warn!(
                            name = %self.name,
                            dir = %self.snapshot_dir.display(),
                            %rm,
                            "failed to delete partial snapshot"
                        );
                    }
                }
                info!(name = %self.name, %err, "local snapshot discarded");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCacheEngine;
    use crate::page::{DEFAULT_PAGE_SIZE, PAGE_HEADER_SIZE};
    use tempfile::TempDir;

    const PS: usize = DEFAULT_PAGE_SIZE;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        cache: Arc<LocalCacheEngine>,
        metastore: Arc<MetaStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("snapshots");
        let cache = Arc::new(LocalCacheEngine::new(dir.path(), "node-0", PS).unwrap());
        cache.create_group(1, "default", &["people"], 2).unwrap();
        let metastore = Arc::new(MetaStore::open(&dir.path().join("work")).unwrap());
        Fixture { _dir: dir, root, cache, metastore }
    }

    fn sink(fx: &Fixture, name: &str) -> LocalSink {
        LocalSink::new(
            name,
            &fx.root,
            fx.cache.clone(),
            fx.metastore.clone(),
            Poison::new(),
            vec!["node-0".to_string()],
        )
    }

    #[tokio::test]
    async fn test_init_writes_marker() {
        let fx = fixture();
        let sink = sink(&fx, "s1");

        sink.init(3).unwrap();
        assert_eq!(fx.metastore.get(SNAPSHOT_IN_PROGRESS_KEY), Some("s1".to_string()));
    }

    #[tokio::test]
    async fn test_full_lifecycle_layout() {
        let fx = fixture();
        let pid = PartitionId::new(1, 0);
        fx.cache.put_page(pid, 0, b"payload").unwrap();
        fx.cache.force_checkpoint("seed").unwrap().wait().await;

        let sink = sink(&fx, "s1");
        sink.init(1).unwrap();
        for cfg in fx.cache.cache_config_files(1).unwrap() {
            sink.send_cache_config(&cfg, "default").unwrap();
        }
        sink.send_type_metadata(b"{}").unwrap();
        sink.send_mapping_metadata(b"{}").unwrap();

        let part_file = fx.cache.partition_file(pid).unwrap();
        sink.send_part(&part_file, "default", pid, PS as u64).unwrap();

        let delta = fx._dir.path().join("part-0.bin.delta");
        fs::write(&delta, b"").unwrap();
        sink.send_delta(&delta, "default", pid).unwrap();

        sink.close(None).unwrap();

        let snap = fx.root.join("s1");
        assert!(snap.join(layout::SNAPSHOT_META_FILE).exists());
        assert!(snap.join(BINARY_META_DIR).join("types.json").exists());
        assert!(snap.join(MARSHALLER_DIR).join("mappings.json").exists());

        let copied = snap.join("db").join("node-0").join("default").join("part-0.bin");
        assert!(copied.exists());
        assert_eq!(fs::metadata(&copied).unwrap().len(), PS as u64);
        assert!(snap
            .join("db")
            .join("node-0")
            .join("default")
            .join("people.conf")
            .exists());

        let copied_bytes = fs::read(&copied).unwrap();
        assert_eq!(&copied_bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 7], b"payload");
    }

    #[tokio::test]
    async fn test_close_with_error_deletes_partial_output() {
        let fx = fixture();
        let sink = sink(&fx, "s1");

        sink.init(1).unwrap();
        sink.send_type_metadata(b"{}").unwrap();
        assert!(fx.root.join("s1").exists());

        sink.close(Some(&SnapshotError::Cancelled)).unwrap();
        assert!(!fx.root.join("s1").exists());
    }

    #[tokio::test]
    async fn test_poisoned_sink_fast_fails() {
        let fx = fixture();
        let poison = Poison::new();
        let sink = LocalSink::new(
            "s1",
            &fx.root,
            fx.cache.clone(),
            fx.metastore.clone(),
            poison.clone(),
            Vec::new(),
        );

        sink.init(1).unwrap();
        poison.poison(SnapshotError::Cancelled);

        assert_eq!(sink.send_type_metadata(b"{}").unwrap_err(), SnapshotError::Cancelled);
        assert_eq!(
            sink.send_part(Path::new("/nope"), "default", PartitionId::new(1, 0), 1)
                .unwrap_err(),
            SnapshotError::Cancelled
        );
        sink.close(Some(&SnapshotError::Cancelled)).unwrap();
    }

    #[tokio::test]
    async fn test_failing_subcall_poisons() {
        let fx = fixture();
        let sink = sink(&fx, "s1");
        sink.init(1).unwrap();

        let missing = Path::new("/definitely/not/here.bin");
        assert!(sink.send_part(missing, "default", PartitionId::new(1, 0), 64).is_err());

        // Later calls fast-fail with the first error.
        assert!(matches!(
            sink.send_type_metadata(b"{}"),
            Err(SnapshotError::StorageFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_len_caps_at_boundary() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, vec![0xAB; 3 * PS]).unwrap();

        let dst = dir.path().join("dst.bin");
        copy_len_with_fsync(&src, &dst, PS as u64).unwrap();
        assert_eq!(fs::metadata(&dst).unwrap().len(), PS as u64);
    }

    #[tokio::test]
    async fn test_copy_len_short_source_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, vec![0xAB; 100]).unwrap();

        let dst = dir.path().join("dst.bin");
        assert!(copy_len_with_fsync(&src, &dst, PS as u64).is_err());
    }
}
