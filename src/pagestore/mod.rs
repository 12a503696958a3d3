//! Partition page store
//!
//! A partition store is a random-access file of fixed-size pages. Writes
//! always cover whole pages, so the file length is a multiple of the page
//! size and the tail is never torn.
//!
//! Recovery mode (`NORMAL → RECOVERING → NORMAL`) supports binary-exact
//! reconstruction from transferred files and delta pages: while
//! recovering, pages are written verbatim without integrity checks;
//! `finish_recover` revalidates every page CRC and persists the final
//! size.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{SnapshotError, SnapshotResult};
use crate::page::{
    is_valid_page_size, read_page_id, stamp_page_crc, verify_page_crc, write_page_id, PageId,
    PartitionId,
};

/// Store recovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Normal operation: writes stamp the page id and recompute the CRC
    Normal,
    /// Reconstruction: pages are written verbatim, validation deferred
    Recovering,
}

/// Random-access page file backing one partition.
#[derive(Debug)]
pub struct PartitionPageStore {
    path: PathBuf,
    partition: PartitionId,
    page_size: usize,
    file: File,
    mode: StoreMode,
    pages: u32,
}

impl PartitionPageStore {
    /// Create a new empty store, truncating any existing file.
    pub fn create(path: &Path, partition: PartitionId, page_size: usize) -> SnapshotResult<Self> {
        Self::validate_page_size(page_size)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SnapshotError::storage(parent.display(), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SnapshotError::storage(path.display(), e))?;

        Ok(Self {
            path: path.to_path_buf(),
            partition,
            page_size,
            file,
            mode: StoreMode::Normal,
            pages: 0,
        })
    }

    /// Open an existing store.
    ///
    /// Fails with `StorageFailed` when the file length is not a multiple
    /// of the page size.
    pub fn open(path: &Path, partition: PartitionId, page_size: usize) -> SnapshotResult<Self> {
        Self::validate_page_size(page_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SnapshotError::storage(path.display(), e))?;

        let len = file
            .metadata()
            .map_err(|e| SnapshotError::storage(path.display(), e))?
            .len();

        if len % page_size as u64 != 0 {
            return Err(SnapshotError::StorageFailed(format!(
                "partition file is not page aligned: {} ({} bytes, page size {})",
                path.display(),
                len,
                page_size
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            partition,
            page_size,
            file,
            mode: StoreMode::Normal,
            pages: (len / page_size as u64) as u32,
        })
    }

    fn validate_page_size(page_size: usize) -> SnapshotResult<()> {
        if !is_valid_page_size(page_size) {
            return Err(SnapshotError::StorageFailed(format!(
                "invalid page size: {}",
                page_size
            )));
        }
        Ok(())
    }

    /// Partition this store belongs to.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages currently in the file.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// File size in bytes; always a whole number of pages.
    pub fn size(&self) -> u64 {
        self.pages as u64 * self.page_size as u64
    }

    /// Current recovery mode.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Read the page at `page_index` into `buf`.
    pub fn read(&mut self, page_index: u32, buf: &mut [u8]) -> SnapshotResult<()> {
        self.check_buf(buf.len())?;

        if page_index >= self.pages {
            return Err(SnapshotError::StorageFailed(format!(
                "page index {} out of bounds for {} ({} pages)",
                page_index, self.partition, self.pages
            )));
        }

        self.file
            .seek(SeekFrom::Start(page_index as u64 * self.page_size as u64))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| SnapshotError::storage(self.path.display(), e))
    }

    /// Write a whole page at the index carried by `page_id`.
    ///
    /// In normal mode the page id is stamped and the CRC recomputed
    /// before the page reaches disk. In recovery mode the buffer is
    /// written verbatim. Writing past the current tail grows the file by
    /// whole pages.
    pub fn write(&mut self, page_id: PageId, buf: &mut [u8]) -> SnapshotResult<()> {
        self.check_buf(buf.len())?;

        if self.mode == StoreMode::Normal {
            write_page_id(buf, page_id);
            stamp_page_crc(buf);
        }

        let index = page_id.page_index();
        self.file
            .seek(SeekFrom::Start(index as u64 * self.page_size as u64))
            .and_then(|_| self.file.write_all(buf))
            .map_err(|e| SnapshotError::storage(self.path.display(), e))?;

        if index >= self.pages {
            self.pages = index + 1;
            // Writing past EOF leaves a hole of zero pages, which read
            // back as unallocated; make the length page-exact anyway.
            self.file
                .set_len(self.pages as u64 * self.page_size as u64)
                .map_err(|e| SnapshotError::storage(self.path.display(), e))?;
        }

        Ok(())
    }

    /// Enter recovery mode.
    pub fn begin_recover(&mut self) {
        self.mode = StoreMode::Recovering;
    }

    /// Leave recovery mode: revalidate every page CRC and persist the
    /// final size.
    ///
    /// Fails with `InvalidPage` on the first CRC mismatch; the store
    /// stays in recovery mode so the caller can drop it with its data.
    pub fn finish_recover(&mut self) -> SnapshotResult<u64> {
        self.file
            .flush()
            .map_err(|e| SnapshotError::storage(self.path.display(), e))?;

        let mut buf = vec![0u8; self.page_size];
        for index in 0..self.pages {
            self.file
                .seek(SeekFrom::Start(index as u64 * self.page_size as u64))
                .and_then(|_| self.file.read_exact(&mut buf))
                .map_err(|e| SnapshotError::storage(self.path.display(), e))?;

            if !verify_page_crc(&buf) {
                return Err(SnapshotError::InvalidPage(format!(
                    "{} at {} in {}",
                    read_page_id(&buf),
                    index,
                    self.path.display()
                )));
            }
        }

        self.sync()?;
        self.mode = StoreMode::Normal;
        Ok(self.size())
    }

    /// Flush file contents to disk.
    pub fn sync(&mut self) -> SnapshotResult<()> {
        self.file
            .sync_all()
            .map_err(|e| SnapshotError::storage(self.path.display(), e))
    }

    fn check_buf(&self, len: usize) -> SnapshotResult<()> {
        if len != self.page_size {
            return Err(SnapshotError::StorageFailed(format!(
                "buffer length {} does not match page size {}",
                len, self.page_size
            )));
        }
        Ok(())
    }
}
