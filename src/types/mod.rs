//! Common types and on-disk geometry used throughout the storage engine.

mod page_id;

pub use page_id::PageId;

/// Page size in bytes (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Fixed page header size; the payload starts at this offset
pub const PAGE_HEADER_SIZE: usize = 128;

/// Payload bytes available in a leaf page
pub const LEAF_SPACE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Size of one leaf slot record: key(8) + size(2) + offset(2) + trx_id(4)
pub const SLOT_SIZE: usize = 16;

/// Size of one internal entry: key(8) + child(8)
pub const ENTRY_SIZE: usize = 16;

/// Maximum entries held by an internal page
pub const ENTRY_CAPACITY: usize = LEAF_SPACE / ENTRY_SIZE; // 248

/// Maximum value size storable in a leaf record
pub const MAX_VALUE_SIZE: usize = 112;

/// A leaf split moves records once the running size reaches this point
pub const LEAF_SPLIT_TARGET: usize = LEAF_SPACE / 2; // 1984

/// A leaf with at least this much free space is considered underfull
/// after a delete and tries to merge or redistribute
pub const LEAF_MERGE_THRESHOLD: usize = 2500;

/// An internal page with fewer keys than this is underfull
pub const ENTRY_UNDERFLOW: usize = ENTRY_CAPACITY / 2; // 124

/// Initial table file size: 10 MiB worth of pages
pub const INITIAL_PAGE_COUNT: u64 = (10 * 1024 * 1024 / PAGE_SIZE) as u64; // 2560

/// Identifier of an open table, assigned from 1 in open order
pub type TableId = i64;

/// Transaction identifier; 0 is reserved for "no transaction"
pub type TrxId = u32;

/// Log sequence number: byte offset of a record in the log file; 0 is nil
pub type Lsn = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(LEAF_SPACE, 3968);
        assert_eq!(ENTRY_CAPACITY, 248);
        assert_eq!(LEAF_SPLIT_TARGET, 1984);
        assert_eq!(INITIAL_PAGE_COUNT, 2560);
        // a full-size record always fits well under the split target
        assert!(SLOT_SIZE + MAX_VALUE_SIZE < LEAF_SPLIT_TARGET);
    }
}
