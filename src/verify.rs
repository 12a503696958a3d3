//! Local snapshot verification
//!
//! Walks every partition file of a completed snapshot and checks that
//! its size is a whole number of pages and that every non-zero page
//! satisfies its embedded CRC.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout::{self, SnapshotMeta, DB_DIR};
use crate::page::verify_page_crc;

/// Outcome of a successful verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Partition files checked, index files included
    pub partitions: u32,
    /// Pages validated across all files
    pub pages: u64,
}

/// Verify a completed snapshot under `snapshot_root`.
pub fn verify_snapshot(snapshot_root: &Path, name: &str) -> SnapshotResult<VerifyReport> {
    let snapshot_dir = layout::snapshot_dir(snapshot_root, name);
    let meta = SnapshotMeta::read(&snapshot_dir)?;
    let page_size = meta.page_size;

    let mut report = VerifyReport { partitions: 0, pages: 0 };
    let db = snapshot_dir.join(DB_DIR);

    for node_entry in read_dir(&db)? {
        for group_entry in read_dir(&node_entry)? {
            for file in read_files(&group_entry)? {
                let file_name = match file.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                if layout::parse_partition_file_name(&file_name).is_none() {
                    continue;
                }

                report.pages += verify_partition_file(&file, page_size)?;
                report.partitions += 1;
            }
        }
    }

    debug!(name, partitions = report.partitions, pages = report.pages, "snapshot verified");
    Ok(report)
}

fn verify_partition_file(path: &Path, page_size: usize) -> SnapshotResult<u64> {
    let len = fs::metadata(path).map_err(|e| SnapshotError::storage(path.display(), e))?.len();
    if len % page_size as u64 != 0 {
        return Err(SnapshotError::InvalidPage(format!(
            "{} is not a whole number of pages ({} bytes)",
            path.display(),
            len
        )));
    }

    let mut file = File::open(path).map_err(|e| SnapshotError::storage(path.display(), e))?;
    let mut buf = vec![0u8; page_size];
    let pages = len / page_size as u64;

    for index in 0..pages {
        file.read_exact(&mut buf).map_err(|e| SnapshotError::storage(path.display(), e))?;
        if !verify_page_crc(&buf) {
            return Err(SnapshotError::InvalidPage(format!(
                "page {} of {}",
                index,
                path.display()
            )));
        }
    }

    Ok(pages)
}

fn read_dir(path: &Path) -> SnapshotResult<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| SnapshotError::storage(path.display(), e))? {
        let entry = entry.map_err(|e| SnapshotError::storage(path.display(), e))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn read_files(path: &Path) -> SnapshotResult<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| SnapshotError::storage(path.display(), e))? {
        let entry = entry.map_err(|e| SnapshotError::storage(path.display(), e))?;
        if entry.path().is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{stamp_page_crc, write_page_id, PageId, DEFAULT_PAGE_SIZE};
    use tempfile::TempDir;

    const PS: usize = DEFAULT_PAGE_SIZE;

    fn write_snapshot(root: &Path, name: &str, corrupt: bool) {
        let group = root.join(name).join(DB_DIR).join("node-0").join("default");
        fs::create_dir_all(&group).unwrap();

        let mut page = vec![0u8; PS];
        page[64] = 0x42;
        write_page_id(&mut page, PageId::new(0, 0));
        stamp_page_crc(&mut page);
        if corrupt {
            page[100] ^= 0xFF;
        }
        fs::write(group.join("part-0.bin"), &page).unwrap();
        fs::write(group.join("people.conf"), b"{}").unwrap();

        let meta = SnapshotMeta {
            name: name.to_string(),
            node_folder: "node-0".to_string(),
            page_size: PS,
            baseline: vec![],
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        meta.write(&root.join(name)).unwrap();
    }

    #[test]
    fn test_verify_clean_snapshot() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "s1", false);

        let report = verify_snapshot(dir.path(), "s1").unwrap();
        assert_eq!(report, VerifyReport { partitions: 1, pages: 1 });
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "s1", true);

        let err = verify_snapshot(dir.path(), "s1").unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPage(_)));
    }

    #[test]
    fn test_verify_rejects_unaligned_file() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "s1", false);
        let part = dir
            .path()
            .join("s1")
            .join(DB_DIR)
            .join("node-0")
            .join("default")
            .join("part-0.bin");
        let mut bytes = fs::read(&part).unwrap();
        bytes.truncate(PS - 7);
        fs::write(&part, bytes).unwrap();

        let err = verify_snapshot(dir.path(), "s1").unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPage(_)));
    }

    #[test]
    fn test_verify_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        assert!(verify_snapshot(dir.path(), "nope").is_err());
    }
}
