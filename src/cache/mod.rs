//! Cache processor capability interface
//!
//! The snapshot engine does not know the cache processor's internals; it
//! consumes a narrow capability surface: enumerate groups and partitions,
//! resolve partition files, read type/mapping metadata, flush the WAL,
//! take the checkpoint read lock, schedule a checkpoint listener and
//! install copy-on-write interceptors. Concrete implementations are
//! chosen by configuration at construction time; [`LocalCacheEngine`] is
//! the file-backed one.

mod local;

pub use local::LocalCacheEngine;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;

use crate::delta::DeltaWriter;
use crate::errors::SnapshotResult;
use crate::page::PartitionId;

/// One cache group as seen by the snapshot engine.
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    /// Stable group id
    pub group_id: i32,
    /// Group name; doubles as the group directory name
    pub name: String,
    /// Caches sharing this group
    pub caches: Vec<String>,
}

/// Callback invoked by the checkpoint thread at the checkpoint boundary.
pub trait CheckpointListener: Send + Sync {
    /// Runs under the checkpoint write phase, before any dirty page is
    /// flushed. Partition page counts observed here are the consistent
    /// cut the snapshot captures.
    fn on_checkpoint_begin(&self, cx: &CheckpointContext);
}

/// Boundary state handed to checkpoint listeners.
pub struct CheckpointContext {
    boundary_pages: HashMap<PartitionId, u32>,
    staged: Mutex<Vec<(PartitionId, Arc<DeltaWriter>)>>,
    finished: watch::Receiver<bool>,
}

impl CheckpointContext {
    pub(crate) fn new(
        boundary_pages: HashMap<PartitionId, u32>,
        finished: watch::Receiver<bool>,
    ) -> Self {
        Self { boundary_pages, staged: Mutex::new(Vec::new()), finished }
    }

    /// Partition page count at the boundary; zero for an unknown
    /// partition.
    pub fn pages(&self, partition: PartitionId) -> u32 {
        self.boundary_pages.get(&partition).copied().unwrap_or(0)
    }

    /// Stage a delta interceptor for a partition.
    ///
    /// Staged interceptors become live once this checkpoint has flushed:
    /// the flush itself writes the boundary state and must not be
    /// captured as pre-images.
    pub fn install_interceptor(&self, partition: PartitionId, writer: Arc<DeltaWriter>) {
        self.staged.lock().expect("staged lock poisoned").push((partition, writer));
    }

    /// A handle resolving when this checkpoint has finished flushing.
    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle { finished: self.finished.clone() }
    }

    pub(crate) fn take_staged(&self) -> Vec<(PartitionId, Arc<DeltaWriter>)> {
        std::mem::take(&mut *self.staged.lock().expect("staged lock poisoned"))
    }
}

/// Completion handle of one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    finished: watch::Receiver<bool>,
}

impl CheckpointHandle {
    /// Wait until the checkpoint has flushed and synced.
    pub async fn wait(mut self) {
        while !*self.finished.borrow() {
            if self.finished.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Capability surface the snapshot engine consumes from the cache
/// processor.
pub trait CacheEngine: Send + Sync {
    /// Cluster-wide page size.
    fn page_size(&self) -> usize;

    /// Stable per-node database folder name.
    fn node_folder(&self) -> String;

    /// Node database path relative to a storage root.
    fn node_path(&self) -> String {
        format!("db/{}", self.node_folder())
    }

    /// All cache groups.
    fn groups(&self) -> Vec<GroupDescriptor>;

    /// One cache group, if it exists.
    fn group(&self, group_id: i32) -> Option<GroupDescriptor>;

    /// Local data partitions of a group, sorted; fails with
    /// `CacheGroupStopped` for an unknown group.
    fn partitions(&self, group_id: i32) -> SnapshotResult<Vec<i32>>;

    /// Path of a partition's backing file.
    fn partition_file(&self, partition: PartitionId) -> SnapshotResult<PathBuf>;

    /// Cache configuration files of a group.
    fn cache_config_files(&self, group_id: i32) -> SnapshotResult<Vec<PathBuf>>;

    /// Serialized binary type metadata.
    fn type_metadata(&self) -> SnapshotResult<Vec<u8>>;

    /// Serialized marshaller mapping metadata.
    fn mapping_metadata(&self) -> SnapshotResult<Vec<u8>>;

    /// Flush the write-ahead log up to the current point.
    fn flush_wal(&self) -> SnapshotResult<()>;

    /// The checkpoint read lock. Mutations that must be atomic with
    /// respect to snapshot emission (marker writes, cache stop
    /// preparation) run under the read side; the checkpoint boundary
    /// takes the write side.
    fn checkpoint_lock(&self) -> &RwLock<()>;

    /// Register a listener for the next checkpoint boundary.
    fn schedule_checkpoint_listener(&self, listener: Arc<dyn CheckpointListener>);

    /// Remove one live delta interceptor, identified by the writer that
    /// was installed; other windows open on the same partition stay
    /// live.
    fn remove_page_interceptor(&self, partition: PartitionId, writer: &Arc<DeltaWriter>);

    /// Trigger a checkpoint.
    fn force_checkpoint(&self, reason: &str) -> SnapshotResult<CheckpointHandle>;
}
