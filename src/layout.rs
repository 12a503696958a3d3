//! On-disk snapshot layout
//!
//! ```text
//! <snapRoot>/<snapName>/
//!     snapshot_meta.json
//!     db/<nodeFolder>/<cacheOrGroupDir>/
//!         <cache-config-file>
//!         index.bin
//!         part-<N>.bin
//!     binary_meta/
//!     marshaller/
//! <tmpWorkDir>/<snapName>/db/<nodeFolder>/<cacheOrGroupDir>/
//!     index.bin.delta
//!     part-<N>.bin.delta
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{SnapshotError, SnapshotResult};
use crate::page::{PartitionId, INDEX_PARTITION};

/// Directory under a snapshot that mirrors the node database layout
pub const DB_DIR: &str = "db";

/// Directory holding binary type metadata
pub const BINARY_META_DIR: &str = "binary_meta";

/// Directory holding marshaller mapping metadata
pub const MARSHALLER_DIR: &str = "marshaller";

/// Top-level marker file recording the snapshot name and topology
pub const SNAPSHOT_META_FILE: &str = "snapshot_meta.json";

/// File name of the group-level index partition
pub const INDEX_FILE_NAME: &str = "index.bin";

/// Suffix of copy-on-write delta files
pub const DELTA_SUFFIX: &str = ".delta";

/// Directory for in-flight snapshot work under the node work dir
pub const TMP_SNAPSHOT_DIR: &str = "snp-tmp";

/// Path of a named snapshot under the snapshot root.
pub fn snapshot_dir(snapshot_root: &Path, name: &str) -> PathBuf {
    snapshot_root.join(name)
}

/// Per-node database directory inside a snapshot.
pub fn node_db_dir(snapshot_root: &Path, name: &str, node_folder: &str) -> PathBuf {
    snapshot_dir(snapshot_root, name).join(DB_DIR).join(node_folder)
}

/// Group directory inside a node database directory.
pub fn group_dir(node_db: &Path, cache_dir: &str) -> PathBuf {
    node_db.join(cache_dir)
}

/// File name of a partition store (`part-<N>.bin`, `index.bin` for the
/// index partition).
pub fn partition_file_name(partition: PartitionId) -> String {
    if partition.is_index() {
        INDEX_FILE_NAME.to_string()
    } else {
        format!("part-{}.bin", partition.partition_id)
    }
}

/// File name of the delta paired with a partition store.
pub fn delta_file_name(partition: PartitionId) -> String {
    format!("{}{}", partition_file_name(partition), DELTA_SUFFIX)
}

/// Parse a partition file name back to its partition id, if it is one.
pub fn parse_partition_file_name(file_name: &str) -> Option<i32> {
    if file_name == INDEX_FILE_NAME {
        return Some(INDEX_PARTITION);
    }
    let digits = file_name.strip_prefix("part-")?.strip_suffix(".bin")?;
    digits.parse::<i32>().ok()
}

/// Top-level marker of a completed snapshot.
///
/// Written by the local sink once the snapshot directory is laid out; a
/// directory without it is in-flight or interrupted and is never listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Cluster-wide snapshot name
    pub name: String,
    /// Folder of the node that wrote this copy
    pub node_folder: String,
    /// Page size the snapshot was taken with
    pub page_size: usize,
    /// Baseline nodes the snapshot is defined over
    pub baseline: Vec<String>,
    /// Creation timestamp, RFC3339
    pub created_at: String,
}

impl SnapshotMeta {
    /// Write the marker with fsync.
    pub fn write(&self, snapshot_dir: &Path) -> SnapshotResult<()> {
        let path = snapshot_dir.join(SNAPSHOT_META_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SnapshotError::StorageFailed(format!("snapshot meta: {}", e)))?;

        let file_result = (|| {
            use std::io::Write;
            let mut file = fs::File::create(&path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        })();
        file_result.map_err(|e| SnapshotError::storage(path.display(), e))
    }

    /// Read the marker of a snapshot directory.
    pub fn read(snapshot_dir: &Path) -> SnapshotResult<Self> {
        let path = snapshot_dir.join(SNAPSHOT_META_FILE);
        let raw = fs::read_to_string(&path)
            .map_err(|e| SnapshotError::storage(path.display(), e))?;
        serde_json::from_str(&raw).map_err(|e| {
            SnapshotError::StorageFailed(format!("snapshot meta {}: {}", path.display(), e))
        })
    }
}

/// Names of completed snapshots under the snapshot root.
///
/// A directory counts as a snapshot only when its top-level marker file is
/// present; in-flight or interrupted directories are skipped.
pub fn list_snapshots(snapshot_root: &Path) -> SnapshotResult<Vec<String>> {
    let mut names = Vec::new();

    if !snapshot_root.exists() {
        return Ok(names);
    }

    for entry in fs::read_dir(snapshot_root)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        if !entry.path().join(SNAPSHOT_META_FILE).exists() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    names.sort();
    Ok(names)
}
