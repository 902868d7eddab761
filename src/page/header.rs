//! Page header field accessors.
//!
//! Header layout (128 bytes):
//! ```text
//! Offset  Size  Tree page            Header page (pid 0)   Free page
//! 0       8     parent_page          first_free_page       next_free_page
//! 8       4     is_leaf              num_pages (8 bytes)   -
//! 12      4     num_keys             ^                     -
//! 16      8     -                    root_page             -
//! 24      8     page_lsn             page_lsn              -
//! 32      8     reserved             magic "TXBTREE1"      -
//! 40      4     reserved             crc32 of bytes 0..24  -
//! ...           reserved             reserved              -
//! 112     8     free_space (leaf)    -                     -
//! 120     8     sibling (leaf) /     -                     -
//!               left_child (internal)
//! ```

use crate::error::{Result, StorageError};
use crate::types::{Lsn, PageId, LEAF_SPACE};

use super::Page;

const OFF_PARENT: usize = 0;
const OFF_IS_LEAF: usize = 8;
const OFF_NUM_KEYS: usize = 12;
const OFF_PAGE_LSN: usize = 24;
const OFF_FREE_SPACE: usize = 112;
const OFF_SIBLING: usize = 120;

const OFF_FIRST_FREE: usize = 0;
const OFF_NUM_PAGES: usize = 8;
const OFF_ROOT: usize = 16;
const OFF_MAGIC: usize = 32;
const OFF_CRC: usize = 40;

/// The checksum covers the three header fields but not `page_lsn`,
/// which is restamped on every logged change to page 0
const CRC_RANGE: usize = 24;

const OFF_NEXT_FREE: usize = 0;

/// Magic bytes identifying a valid table header page
pub const TABLE_MAGIC: &[u8; 8] = b"TXBTREE1";

impl Page {
    // --- common ---

    pub fn page_lsn(&self) -> Lsn {
        self.read_u64(OFF_PAGE_LSN)
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.write_u64(OFF_PAGE_LSN, lsn);
    }

    // --- tree pages ---

    pub fn parent(&self) -> PageId {
        self.read_pid(OFF_PARENT)
    }

    pub fn set_parent(&mut self, pid: PageId) {
        self.write_pid(OFF_PARENT, pid);
    }

    pub fn is_leaf(&self) -> bool {
        self.read_u32(OFF_IS_LEAF) != 0
    }

    pub fn num_keys(&self) -> usize {
        self.read_u32(OFF_NUM_KEYS) as usize
    }

    pub fn set_num_keys(&mut self, n: usize) {
        self.write_u32(OFF_NUM_KEYS, n as u32);
    }

    /// Unused payload bytes of a leaf, between the slot array and the
    /// packed value region
    pub fn free_space(&self) -> usize {
        self.read_u64(OFF_FREE_SPACE) as usize
    }

    pub fn set_free_space(&mut self, n: usize) {
        self.write_u64(OFF_FREE_SPACE, n as u64);
    }

    /// Right sibling of a leaf page, nil at the tail of the chain
    pub fn sibling(&self) -> PageId {
        self.read_pid(OFF_SIBLING)
    }

    pub fn set_sibling(&mut self, pid: PageId) {
        self.write_pid(OFF_SIBLING, pid);
    }

    /// Child of an internal page holding keys below `entries[0].key`
    pub fn left_child(&self) -> PageId {
        self.read_pid(OFF_SIBLING)
    }

    pub fn set_left_child(&mut self, pid: PageId) {
        self.write_pid(OFF_SIBLING, pid);
    }

    /// Reset this page as an empty leaf
    pub fn init_leaf(&mut self) {
        self.as_bytes_mut().fill(0);
        self.write_u32(OFF_IS_LEAF, 1);
        self.set_free_space(LEAF_SPACE);
    }

    /// Reset this page as an empty internal page
    pub fn init_internal(&mut self) {
        self.as_bytes_mut().fill(0);
    }

    // --- free pages ---

    pub fn next_free(&self) -> PageId {
        self.read_pid(OFF_NEXT_FREE)
    }

    pub fn set_next_free(&mut self, pid: PageId) {
        self.write_pid(OFF_NEXT_FREE, pid);
    }

    // --- header page (page 0) ---

    pub fn first_free_page(&self) -> PageId {
        self.read_pid(OFF_FIRST_FREE)
    }

    pub fn set_first_free_page(&mut self, pid: PageId) {
        self.write_pid(OFF_FIRST_FREE, pid);
        self.seal_header();
    }

    pub fn num_pages(&self) -> u64 {
        self.read_u64(OFF_NUM_PAGES)
    }

    pub fn set_num_pages(&mut self, n: u64) {
        self.write_u64(OFF_NUM_PAGES, n);
        self.seal_header();
    }

    pub fn root_page(&self) -> PageId {
        self.read_pid(OFF_ROOT)
    }

    pub fn set_root_page(&mut self, pid: PageId) {
        self.write_pid(OFF_ROOT, pid);
        self.seal_header();
    }

    /// Initialize page 0 of a fresh table file
    pub fn init_header_page(&mut self, num_pages: u64, first_free: PageId) {
        self.as_bytes_mut().fill(0);
        self.write_pid(OFF_FIRST_FREE, first_free);
        self.write_u64(OFF_NUM_PAGES, num_pages);
        self.write_pid(OFF_ROOT, PageId::NIL);
        self.write_range(OFF_MAGIC, TABLE_MAGIC);
        self.seal_header();
    }

    /// Verify the magic and checksum of a header page read off disk
    pub fn verify_header_page(&self) -> Result<()> {
        if self.range(OFF_MAGIC, TABLE_MAGIC.len()) != TABLE_MAGIC {
            return Err(StorageError::corrupt("bad table file magic"));
        }
        let stored = self.read_u32(OFF_CRC);
        let computed = crc32fast::hash(self.range(0, CRC_RANGE));
        if stored != computed {
            return Err(StorageError::corrupt("table header checksum mismatch"));
        }
        Ok(())
    }

    fn seal_header(&mut self) {
        let crc = crc32fast::hash(self.range(0, CRC_RANGE));
        self.write_u32(OFF_CRC, crc);
    }
}
