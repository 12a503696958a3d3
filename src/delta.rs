//! Copy-on-write delta capture
//!
//! While a snapshot window is open, every page about to be overwritten on
//! the live partition has its pre-image appended to a per-partition delta
//! file. Reconstruction rewrites each captured page by the page id
//! embedded in its header, so ordering within the delta file does not
//! matter; only the set of captured pre-images does.
//!
//! A page is captured at most once per window. The captured set is a
//! bitmap of atomic words, so the hot path for an already-captured page
//! is a single relaxed load plus a compare-free fetch_or.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::errors::{SnapshotError, SnapshotResult};
use crate::page::{read_page_id, PageId, PartitionId};
use crate::pagestore::PartitionPageStore;

/// Per-partition serial writer of page pre-images.
#[derive(Debug)]
pub struct DeltaWriter {
    partition: PartitionId,
    path: PathBuf,
    page_size: usize,
    page_limit: u32,
    captured: Box<[AtomicU64]>,
    file: Mutex<File>,
    captured_count: AtomicU32,
    closed: AtomicBool,
    failed: Mutex<Option<SnapshotError>>,
}

impl DeltaWriter {
    /// Open a delta file for one partition.
    ///
    /// `page_limit` is the partition page count at the checkpoint
    /// boundary. The clean copy is truncated to that length, so
    /// pre-images of pages at a later index are never needed and such
    /// calls are ignored.
    pub fn open(
        partition: PartitionId,
        path: &Path,
        page_size: usize,
        page_limit: u32,
    ) -> SnapshotResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SnapshotError::storage(parent.display(), e))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SnapshotError::storage(path.display(), e))?;

        let words = (page_limit as usize).div_ceil(64);
        let captured = (0..words).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();

        debug!(partition = %partition, limit = page_limit, "delta capture window opened");

        Ok(Self {
            partition,
            path: path.to_path_buf(),
            page_size,
            page_limit,
            captured: captured.into_boxed_slice(),
            file: Mutex::new(file),
            captured_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            failed: Mutex::new(None),
        })
    }

    /// Partition this writer captures for.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Path of the delta file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pre-images captured so far.
    pub fn pages_captured(&self) -> u32 {
        self.captured_count.load(Ordering::Relaxed)
    }

    /// True once the capture window has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Capture the pre-image of a page that is about to be overwritten.
    ///
    /// Invoked under the page's write lock by the checkpoint writer,
    /// before the dirty page is persisted. The first call for a page
    /// appends its pre-image; every later call for the same page is a
    /// no-op.
    pub fn on_page_write(&self, page_id: PageId, pre_image: &[u8]) -> SnapshotResult<()> {
        if self.closed.load(Ordering::Acquire) {
            warn!(partition = %self.partition, %page_id, "pre-image offered after window close");
            return Ok(());
        }

        let index = page_id.page_index();
        if index >= self.page_limit {
            return Ok(());
        }

        if pre_image.len() != self.page_size {
            return Err(SnapshotError::StorageFailed(format!(
                "pre-image length {} does not match page size {}",
                pre_image.len(),
                self.page_size
            )));
        }

        let word = (index / 64) as usize;
        let bit = 1u64 << (index % 64);
        if self.captured[word].fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Ok(());
        }

        let result = {
            let mut file = self.file.lock().expect("delta file lock poisoned");
            file.write_all(pre_image)
                .map_err(|e| SnapshotError::storage(self.path.display(), e))
        };

        match result {
            Ok(()) => {
                self.captured_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    fn fail(&self, err: SnapshotError) {
        let mut failed = self.failed.lock().expect("delta failure lock poisoned");
        if failed.is_none() {
            *failed = Some(err);
        }
    }

    /// Close the capture window: flush and fsync the delta file.
    ///
    /// Returns the first capture failure, if any occurred; a delta with a
    /// lost pre-image cannot reconstruct the boundary state.
    pub fn close(&self) -> SnapshotResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut file = self.file.lock().expect("delta file lock poisoned");
            file.flush()
                .and_then(|_| file.sync_all())
                .map_err(|e| SnapshotError::storage(self.path.display(), e))?;
        }

        if let Some(err) = self.failed.lock().expect("delta failure lock poisoned").clone() {
            return Err(err);
        }

        debug!(
            partition = %self.partition,
            pages = self.pages_captured(),
            "delta capture window closed"
        );
        Ok(())
    }
}

/// Apply a delta file to a partition store.
///
/// Walks the delta page by page and rewrites each page at the index its
/// embedded page id names, under the store's recover bracket. The store
/// ends in normal mode with every page CRC validated.
pub fn apply_delta(store: &mut PartitionPageStore, delta_path: &Path) -> SnapshotResult<u64> {
    let page_size = store.page_size();

    let mut file =
        File::open(delta_path).map_err(|e| SnapshotError::storage(delta_path.display(), e))?;
    let len = file
        .metadata()
        .map_err(|e| SnapshotError::storage(delta_path.display(), e))?
        .len();

    if len % page_size as u64 != 0 {
        return Err(SnapshotError::StorageFailed(format!(
            "delta file is not page aligned: {} ({} bytes)",
            delta_path.display(),
            len
        )));
    }

    store.begin_recover();

    let mut buf = vec![0u8; page_size];
    let pages = len / page_size as u64;
    for _ in 0..pages {
        file.read_exact(&mut buf)
            .map_err(|e| SnapshotError::storage(delta_path.display(), e))?;
        store.write(read_page_id(&buf), &mut buf)?;
    }

    let size = store.finish_recover()?;
    debug!(partition = %store.partition(), pages, "delta applied");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{stamp_page_crc, write_page_id, DEFAULT_PAGE_SIZE, PAGE_HEADER_SIZE};
    use tempfile::TempDir;

    const PS: usize = DEFAULT_PAGE_SIZE;

    fn pre_image(partition_id: i32, index: u32, fill: u8) -> Vec<u8> {
        let mut page = vec![0u8; PS];
        for b in page.iter_mut().skip(PAGE_HEADER_SIZE) {
            *b = fill;
        }
        write_page_id(&mut page, PageId::new(partition_id, index));
        stamp_page_crc(&mut page);
        page
    }

    #[test]
    fn test_first_capture_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part-0.bin.delta");
        let dw = DeltaWriter::open(PartitionId::new(1, 0), &path, PS, 16).unwrap();

        dw.on_page_write(PageId::new(0, 3), &pre_image(0, 3, 0xAA)).unwrap();
        dw.close().unwrap();

        assert_eq!(dw.pages_captured(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), PS as u64);
    }

    #[test]
    fn test_duplicate_capture_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part-0.bin.delta");
        let dw = DeltaWriter::open(PartitionId::new(1, 0), &path, PS, 16).unwrap();

        dw.on_page_write(PageId::new(0, 3), &pre_image(0, 3, 0xAA)).unwrap();
        dw.on_page_write(PageId::new(0, 3), &pre_image(0, 3, 0xBB)).unwrap();
        dw.on_page_write(PageId::new(0, 3), &pre_image(0, 3, 0xCC)).unwrap();
        dw.close().unwrap();

        assert_eq!(dw.pages_captured(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), PS as u64);
    }

    #[test]
    fn test_pages_beyond_boundary_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part-0.bin.delta");
        let dw = DeltaWriter::open(PartitionId::new(1, 0), &path, PS, 4).unwrap();

        dw.on_page_write(PageId::new(0, 4), &pre_image(0, 4, 0xAA)).unwrap();
        dw.on_page_write(PageId::new(0, 100), &pre_image(0, 100, 0xAA)).unwrap();
        dw.close().unwrap();

        assert_eq!(dw.pages_captured(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_capture_after_close_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part-0.bin.delta");
        let dw = DeltaWriter::open(PartitionId::new(1, 0), &path, PS, 16).unwrap();

        dw.close().unwrap();
        dw.on_page_write(PageId::new(0, 1), &pre_image(0, 1, 0xAA)).unwrap();
        assert_eq!(dw.pages_captured(), 0);
    }

    #[test]
    fn test_delta_size_multiple_of_page_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part-0.bin.delta");
        let dw = DeltaWriter::open(PartitionId::new(1, 0), &path, PS, 64).unwrap();

        for idx in [0u32, 5, 9, 33] {
            dw.on_page_write(PageId::new(0, idx), &pre_image(0, idx, idx as u8)).unwrap();
        }
        dw.close().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 4 * PS as u64);
        assert_eq!(len % PS as u64, 0);
    }

    #[test]
    fn test_concurrent_capture_exactly_once() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part-0.bin.delta");
        let dw =
            Arc::new(DeltaWriter::open(PartitionId::new(1, 0), &path, PS, 1024).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dw = Arc::clone(&dw);
            handles.push(std::thread::spawn(move || {
                for idx in 0..64u32 {
                    dw.on_page_write(PageId::new(0, idx), &pre_image(0, idx, idx as u8))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        dw.close().unwrap();

        assert_eq!(dw.pages_captured(), 64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * PS as u64);
    }

    #[test]
    fn test_apply_delta_restores_pre_images() {
        let dir = TempDir::new().unwrap();

        // Partition copy that was overwritten after the boundary.
        let part_path = dir.path().join("part-0.bin");
        let mut store = PartitionPageStore::create(&part_path, PartitionId::new(1, 0), PS).unwrap();
        let mut newer = pre_image(0, 1, 0xEE);
        store.write(read_page_id(&newer), &mut newer).unwrap();
        store.sync().unwrap();

        // Delta carrying the boundary-time pre-image of page 1.
        let delta_path = dir.path().join("part-0.bin.delta");
        let dw = DeltaWriter::open(PartitionId::new(1, 0), &delta_path, PS, 8).unwrap();
        let boundary = pre_image(0, 1, 0x10);
        dw.on_page_write(PageId::new(0, 1), &boundary).unwrap();
        dw.close().unwrap();

        apply_delta(&mut store, &delta_path).unwrap();

        let mut out = vec![0u8; PS];
        store.read(1, &mut out).unwrap();
        assert_eq!(out, boundary);
    }

    #[test]
    fn test_apply_rejects_unaligned_delta() {
        let dir = TempDir::new().unwrap();
        let part_path = dir.path().join("part-0.bin");
        let mut store = PartitionPageStore::create(&part_path, PartitionId::new(1, 0), PS).unwrap();

        let delta_path = dir.path().join("part-0.bin.delta");
        std::fs::write(&delta_path, vec![0u8; PS / 2]).unwrap();

        assert!(apply_delta(&mut store, &delta_path).is_err());
    }

    #[test]
    fn test_apply_empty_delta() {
        let dir = TempDir::new().unwrap();
        let part_path = dir.path().join("part-0.bin");
        let mut store = PartitionPageStore::create(&part_path, PartitionId::new(1, 0), PS).unwrap();
        let mut page = pre_image(0, 0, 0x42);
        store.write(read_page_id(&page), &mut page).unwrap();

        let delta_path = dir.path().join("part-0.bin.delta");
        std::fs::write(&delta_path, b"").unwrap();

        let size = apply_delta(&mut store, &delta_path).unwrap();
        assert_eq!(size, PS as u64);
    }
}
