//! Snapshot senders
//!
//! A sender is the sink a snapshot task drives through a fixed,
//! strictly ordered lifecycle:
//!
//! 1. `init(total_parts)`
//! 2. `send_cache_config` — one per cache in the group
//! 3. `send_type_metadata`
//! 4. `send_mapping_metadata`
//! 5. zero or more `send_part`
//! 6. zero or more `send_delta`, paired 1-to-1 with a prior `send_part`
//! 7. `close(optional_error)` — exactly once; on error any partially
//!    written output is cleaned up
//!
//! The first failing sub-call poisons the sender; every later sub-call
//! returns the poisoning error immediately without doing work, and
//! `close(Some(_))` still runs cleanup. Asynchronous aborts
//! (cancellation, topology changes) poison the same state, so a deep
//! call stack short-circuits through ordinary `Result` returns.

mod local;
mod remote;

pub use local::LocalSink;
pub use remote::RemoteSink;

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::errors::{SnapshotError, SnapshotResult};
use crate::page::PartitionId;

/// Shared poisoned-sender state.
#[derive(Debug, Default)]
pub struct Poison {
    err: Mutex<Option<SnapshotError>>,
}

impl Poison {
    /// Fresh, unpoisoned state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail fast when poisoned.
    pub fn check(&self) -> SnapshotResult<()> {
        match &*self.err.lock().expect("poison lock poisoned") {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Poison with `err` unless already poisoned; returns the effective
    /// first error either way.
    pub fn poison(&self, err: SnapshotError) -> SnapshotError {
        let mut slot = self.err.lock().expect("poison lock poisoned");
        match &*slot {
            Some(first) => first.clone(),
            None => {
                *slot = Some(err.clone());
                err
            }
        }
    }

    /// The poisoning error, if any.
    pub fn get(&self) -> Option<SnapshotError> {
        self.err.lock().expect("poison lock poisoned").clone()
    }
}

/// Sink for the files of one snapshot task.
pub trait SnapshotSender: Send + Sync {
    /// Begin the lifecycle; `total_parts` partitions will follow.
    fn init(&self, total_parts: u32) -> SnapshotResult<()>;

    /// Emit one cache configuration file of a group.
    fn send_cache_config(&self, cfg_file: &Path, cache_dir: &str) -> SnapshotResult<()>;

    /// Emit serialized binary type metadata.
    fn send_type_metadata(&self, types: &[u8]) -> SnapshotResult<()>;

    /// Emit serialized marshaller mapping metadata.
    fn send_mapping_metadata(&self, mappings: &[u8]) -> SnapshotResult<()>;

    /// Emit a clean partition copy truncated to `len` bytes, the
    /// authoritative partition size at the checkpoint boundary.
    fn send_part(
        &self,
        file: &Path,
        cache_dir: &str,
        partition: PartitionId,
        len: u64,
    ) -> SnapshotResult<()>;

    /// Emit the delta paired with a previously sent partition.
    fn send_delta(&self, delta_file: &Path, cache_dir: &str, partition: PartitionId)
        -> SnapshotResult<()>;

    /// Finish the lifecycle. With an error, partially written output is
    /// cleaned up. Invoked exactly once.
    fn close(&self, error: Option<&SnapshotError>) -> SnapshotResult<()>;

    /// True when this sender must be driven strictly sequentially
    /// because it shares one underlying channel.
    fn sequential(&self) -> bool {
        false
    }
}
