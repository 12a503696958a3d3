//! Crash recovery of interrupted snapshots
//!
//! The "snapshot in progress" metastore key names the snapshot a crash
//! interrupted. When the metastore becomes readable, the named snapshot
//! directory and the temp work directory are deleted; once it becomes
//! writable in the same session, the key is cleared. Running the pass
//! twice is a no-op after the first.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout;
use crate::metastore::{MetaStore, SNAPSHOT_IN_PROGRESS_KEY};

/// Startup recovery for the snapshot engine.
pub struct SnapshotRecovery {
    snapshot_root: PathBuf,
    tmp_work_dir: PathBuf,
    metastore: Arc<MetaStore>,
    read_pass_done: AtomicBool,
}

impl SnapshotRecovery {
    /// Recovery over one node's snapshot root and temp work directory.
    pub fn new(snapshot_root: PathBuf, tmp_work_dir: PathBuf, metastore: Arc<MetaStore>) -> Self {
        Self { snapshot_root, tmp_work_dir, metastore, read_pass_done: AtomicBool::new(false) }
    }

    /// Metastore is readable: delete whatever the marker names and empty
    /// the temp work directory. Returns the interrupted snapshot name,
    /// if there was one.
    pub fn on_ready_for_read(&self) -> SnapshotResult<Option<String>> {
        let interrupted = self.metastore.get(SNAPSHOT_IN_PROGRESS_KEY);

        if let Some(name) = &interrupted {
            let dir = layout::snapshot_dir(&self.snapshot_root, name);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| SnapshotError::storage(dir.display(), e))?;
            }
            info!(name, "interrupted snapshot deleted");
        }

        // Temp work is never worth keeping across a restart.
        empty_dir(&self.tmp_work_dir)?;

        self.read_pass_done.store(true, Ordering::Release);
        Ok(interrupted)
    }

    /// Metastore is writable: clear the marker, provided the read pass of
    /// this session already deleted the interrupted directory.
    pub fn on_ready_for_read_write(&self) -> SnapshotResult<()> {
        if !self.read_pass_done.load(Ordering::Acquire) {
            warn!("marker left in place: recovery read pass has not run");
            return Ok(());
        }
        if self.metastore.get(SNAPSHOT_IN_PROGRESS_KEY).is_some() {
            self.metastore.remove(SNAPSHOT_IN_PROGRESS_KEY)?;
            info!("snapshot-in-progress marker cleared");
        }
        Ok(())
    }
}

/// Remove the children of `dir`, keeping the directory itself.
fn empty_dir(dir: &Path) -> SnapshotResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(|e| SnapshotError::storage(dir.display(), e))? {
        let entry = entry.map_err(|e| SnapshotError::storage(dir.display(), e))?;
        let path = entry.path();
        let removed = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
        removed.map_err(|e| SnapshotError::storage(path.display(), e))?;
    }
    Ok(())
}
