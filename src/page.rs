//! Page format shared by partition stores and delta files
//!
//! Every partition file is an ordered sequence of fixed-size pages. The
//! page size is a cluster-wide constant, a power of two between 1 KiB and
//! 16 KiB, fixed at snapshot time.
//!
//! Page layout:
//!
//! ```text
//! offset 0   u32 LE   CRC32 over the page with this field zeroed
//! offset 4   u64 LE   page id
//! offset 12  ...      payload
//! ```
//!
//! The CRC is recomputed after every normal-mode write. A page of all
//! zero bytes is an unallocated page and is exempt from CRC validation.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Smallest supported page size (1 KiB)
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size (16 KiB)
pub const MAX_PAGE_SIZE: usize = 16 * 1024;

/// Default cluster page size (4 KiB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Byte offset of the CRC field within a page
pub const PAGE_CRC_OFFSET: usize = 0;

/// Byte offset of the page id within a page
pub const PAGE_ID_OFFSET: usize = 4;

/// Bytes occupied by the page header (CRC + page id)
pub const PAGE_HEADER_SIZE: usize = 12;

/// Partition id reserved for the group-level index file
pub const INDEX_PARTITION: i32 = 0xFFFF;

/// Largest valid data partition id
pub const MAX_PARTITION_ID: i32 = 65499;

/// Returns true when `page_size` is acceptable cluster-wide.
pub fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

/// Identifies one partition of one cache group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    /// Cache group id
    pub group_id: i32,
    /// Partition index within the group; `INDEX_PARTITION` for the index file
    pub partition_id: i32,
}

impl PartitionId {
    /// Create a partition id.
    pub fn new(group_id: i32, partition_id: i32) -> Self {
        Self { group_id, partition_id }
    }

    /// The group-level index pseudo-partition.
    pub fn index(group_id: i32) -> Self {
        Self { group_id, partition_id: INDEX_PARTITION }
    }

    /// True when this id refers to the group index file.
    pub fn is_index(&self) -> bool {
        self.partition_id == INDEX_PARTITION
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_index() {
            write!(f, "grp={} part=index", self.group_id)
        } else {
            write!(f, "grp={} part={}", self.group_id, self.partition_id)
        }
    }
}

/// 64-bit page identifier embedded in the page header.
///
/// Low 32 bits carry the page index within the partition file, the next
/// 16 bits the partition id. The top 16 bits are flag space owned by the
/// storage engine and are opaque here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    /// Encode a page id for a partition and page index.
    pub fn new(partition_id: i32, page_index: u32) -> Self {
        PageId(((partition_id as u64 & 0xFFFF) << 32) | page_index as u64)
    }

    /// Rebuild a page id from its raw 64-bit form.
    pub fn from_raw(raw: u64) -> Self {
        PageId(raw)
    }

    /// Raw 64-bit form as stored in the page header.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Page index within the partition file.
    pub fn page_index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Partition id carried in the page id.
    pub fn partition_id(self) -> i32 {
        ((self.0 >> 32) & 0xFFFF) as i32
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pageId=[part={}, idx={}]", self.partition_id(), self.page_index())
    }
}

/// Read the page id embedded in a page buffer.
pub fn read_page_id(page: &[u8]) -> PageId {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 8]);
    PageId(u64::from_le_bytes(raw))
}

/// Stamp a page id into a page buffer.
pub fn write_page_id(page: &mut [u8], page_id: PageId) {
    page[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 8].copy_from_slice(&page_id.raw().to_le_bytes());
}

/// Compute the CRC of a page with the CRC field treated as zero.
pub fn compute_page_crc(page: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[0u8; 4]);
    hasher.update(&page[PAGE_CRC_OFFSET + 4..]);
    hasher.finalize()
}

/// Read the CRC stored in a page buffer.
pub fn read_page_crc(page: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&page[PAGE_CRC_OFFSET..PAGE_CRC_OFFSET + 4]);
    u32::from_le_bytes(raw)
}

/// Recompute and store the CRC of a page.
pub fn stamp_page_crc(page: &mut [u8]) {
    let crc = compute_page_crc(page);
    page[PAGE_CRC_OFFSET..PAGE_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
}

/// True when every byte of the page is zero (unallocated page).
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}

/// Validate the stored CRC of a page buffer.
///
/// A zeroed page is unallocated and always passes.
pub fn verify_page_crc(page: &[u8]) -> bool {
    if is_zero_page(page) {
        return true;
    }
    read_page_crc(page) == compute_page_crc(page)
}
