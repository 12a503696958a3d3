//! Snapshot engine configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SnapshotError, SnapshotResult};
use crate::page::{is_valid_page_size, DEFAULT_PAGE_SIZE};

/// Default number of workers in the snapshot pool
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default remote-request handshake timeout
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(15);

/// Default transmission frame payload size
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Root directory for completed snapshots
    pub snapshot_root: PathBuf,

    /// Node work directory: metastore, temp snapshot work, received files
    pub work_dir: PathBuf,

    /// Cluster-wide page size; power of two, 1 KiB - 16 KiB
    pub page_size: usize,

    /// Bounded snapshot pool size for partition copies and delta emission
    pub pool_size: usize,

    /// Remote-request handshake timeout; a pending prior request is
    /// considered abandoned after this window
    #[serde(with = "duration_millis")]
    pub transfer_timeout: Duration,

    /// Transmission frame payload size
    pub chunk_size: usize,
}

impl SnapshotConfig {
    /// Configuration rooted at a single base directory, with defaults for
    /// everything else.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base: PathBuf = base_dir.into();
        Self {
            snapshot_root: base.join("snapshots"),
            work_dir: base.join("work"),
            page_size: DEFAULT_PAGE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the cluster page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Override the snapshot pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Override the remote handshake timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SnapshotResult<()> {
        if !is_valid_page_size(self.page_size) {
            return Err(SnapshotError::StorageFailed(format!(
                "invalid page size: {}",
                self.page_size
            )));
        }
        if self.pool_size == 0 {
            return Err(SnapshotError::StorageFailed(
                "snapshot pool size must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(SnapshotError::StorageFailed(
                "transmission chunk size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Temp directory for in-flight snapshot work.
    pub fn tmp_work_dir(&self) -> PathBuf {
        self.work_dir.join(crate::layout::TMP_SNAPSHOT_DIR)
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
