//! Node metastore
//!
//! A small durable key-value store per node, used for the
//! "snapshot in progress" marker. The marker is written and cleared only
//! under the checkpoint read lock so it moves atomically with respect to
//! checkpoint activity.
//!
//! Writes are atomic: the full map is serialized to a temp file, fsynced,
//! renamed over the live file, and the parent directory fsynced.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::{SnapshotError, SnapshotResult};

/// Metastore key under which the in-flight snapshot name is recorded
pub const SNAPSHOT_IN_PROGRESS_KEY: &str = "snapshot/inProgress";

/// File name of the metastore inside the node work directory
pub const METASTORE_FILE: &str = "metastore.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaState {
    entries: BTreeMap<String, String>,
}

/// File-backed key-value store for node-local snapshot state.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    state: Mutex<MetaState>,
}

impl MetaStore {
    /// Open (or create) the metastore inside `work_dir`.
    pub fn open(work_dir: &Path) -> SnapshotResult<Self> {
        fs::create_dir_all(work_dir).map_err(|e| SnapshotError::storage(work_dir.display(), e))?;

        let path = work_dir.join(METASTORE_FILE);
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| SnapshotError::storage(path.display(), e))?;
            serde_json::from_str(&raw).map_err(|e| {
                SnapshotError::StorageFailed(format!(
                    "failed to parse metastore {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            MetaState::default()
        };

        Ok(Self { path, state: Mutex::new(state) })
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.lock().expect("metastore lock poisoned");
        state.entries.get(key).cloned()
    }

    /// Write a key durably.
    pub fn put(&self, key: &str, value: &str) -> SnapshotResult<()> {
        let mut state = self.state.lock().expect("metastore lock poisoned");
        state.entries.insert(key.to_string(), value.to_string());
        self.persist(&state)
    }

    /// Remove a key durably. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> SnapshotResult<()> {
        let mut state = self.state.lock().expect("metastore lock poisoned");
        if state.entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&state)
    }

    fn persist(&self, state: &MetaState) -> SnapshotResult<()> {
        let json = serde_json::to_string_pretty(state).map_err(|e| {
            SnapshotError::StorageFailed(format!("failed to serialize metastore: {}", e))
        })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file =
                File::create(&tmp).map_err(|e| SnapshotError::storage(tmp.display(), e))?;
            use std::io::Write;
            file.write_all(json.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| SnapshotError::storage(tmp.display(), e))?;
        }

        fs::rename(&tmp, &self.path)
            .map_err(|e| SnapshotError::storage(self.path.display(), e))?;

        if let Some(parent) = self.path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .map_err(|e| SnapshotError::storage(parent.display(), e))?;
            dir.sync_all().map_err(|e| SnapshotError::storage(parent.display(), e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        assert_eq!(store.get(SNAPSHOT_IN_PROGRESS_KEY), None);
        store.put(SNAPSHOT_IN_PROGRESS_KEY, "s1").unwrap();
        assert_eq!(store.get(SNAPSHOT_IN_PROGRESS_KEY), Some("s1".to_string()));
        store.remove(SNAPSHOT_IN_PROGRESS_KEY).unwrap();
        assert_eq!(store.get(SNAPSHOT_IN_PROGRESS_KEY), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.put(SNAPSHOT_IN_PROGRESS_KEY, "s1").unwrap();
            store.put("other", "value").unwrap();
        }

        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.get(SNAPSHOT_IN_PROGRESS_KEY), Some("s1".to_string()));
        assert_eq!(store.get("other"), Some("value".to_string()));
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.remove("nope").unwrap();
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.put("k", "v").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_metastore_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(METASTORE_FILE), "not json").unwrap();
        assert!(MetaStore::open(dir.path()).is_err());
    }
}
