//! B+tree insertion: leaf inserts, leaf and internal splits, root
//! growth.
//!
//! `insert` is autocommit: the whole operation runs inside an internal
//! transaction that logs an image of every page it changes, so a
//! committed insert is redone by recovery and a torn one is rolled
//! back.

use log::debug;

use crate::error::{Result, StorageError};
use crate::page::{Entry, LeafRecord};
use crate::types::{
    PageId, TableId, TrxId, ENTRY_CAPACITY, LEAF_SPLIT_TARGET, SLOT_SIZE,
};

use super::tree::BTree;

impl BTree {
    /// Insert `(key, value)`; rejects duplicates
    pub fn insert(&self, table: TableId, key: i64, value: &[u8]) -> Result<()> {
        self.validate_value(value)?;
        let _latch = self.latch.lock();
        let trx = self.trxs.begin();
        match self.insert_tree(trx, table, key, value) {
            Ok(()) => self.trxs.commit(trx),
            Err(err) => {
                self.trxs.abort(trx, &self.pool)?;
                Err(err)
            }
        }
    }

    fn insert_tree(&self, trx: TrxId, table: TableId, key: i64, value: &[u8]) -> Result<()> {
        if self.root_page(table)?.is_nil() {
            return self.start_tree(trx, table, key, value);
        }

        let leaf = self
            .find_leaf(table, key)?
            .ok_or_else(|| StorageError::corrupt("non-empty tree without a reachable leaf"))?;
        let (duplicate, fits) = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let page = guard.read();
            (page.leaf_search(key).is_some(), page.leaf_can_fit(value.len()))
        };
        if duplicate {
            return Err(StorageError::Duplicate(key));
        }

        if fits {
            self.insert_into_leaf(trx, table, leaf, key, value)
        } else {
            self.insert_into_leaf_split(trx, table, leaf, key, value)
        }
    }

    /// First record of an empty tree: allocate a leaf root and point
    /// the header at it
    fn start_tree(&self, trx: TrxId, table: TableId, key: i64, value: &[u8]) -> Result<()> {
        let root = self.alloc_page(trx, table)?;
        {
            let guard = self.pool.fetch_page_mut(table, root)?;
            let mut page = guard.write();
            let before = page.clone();
            page.init_leaf();
            page.leaf_insert(key, value);
            self.log_page_image(trx, table, root, &before, &mut page)?;
        }
        self.set_root(trx, table, root)?;
        debug!("table {}: new tree rooted at {}", table, root);
        Ok(())
    }

    fn insert_into_leaf(
        &self,
        trx: TrxId,
        table: TableId,
        leaf: PageId,
        key: i64,
        value: &[u8],
    ) -> Result<()> {
        let guard = self.pool.fetch_page_mut(table, leaf)?;
        let mut page = guard.write();
        let before = page.clone();
        page.leaf_insert(key, value);
        debug_assert!(page.leaf_accounting_ok());
        self.log_page_image(trx, table, leaf, &before, &mut page)
    }

    /// Split a full leaf around the new record. Records up to the
    /// first point where the running record size reaches half the
    /// payload stay in the old leaf; the rest move to a new right
    /// sibling whose first key is propagated to the parent.
    fn insert_into_leaf_split(
        &self,
        trx: TrxId,
        table: TableId,
        leaf: PageId,
        key: i64,
        value: &[u8],
    ) -> Result<()> {
        let (mut records, parent, old_sibling) = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let page = guard.read();
            (page.leaf_collect(), page.parent(), page.sibling())
        };
        let at = records
            .iter()
            .position(|r| r.key > key)
            .unwrap_or(records.len());
        records.insert(
            at,
            LeafRecord {
                key,
                trx_id: 0,
                value: value.to_vec(),
            },
        );

        let mut total = 0usize;
        let mut split = 0usize;
        for (i, rec) in records.iter().enumerate() {
            total += SLOT_SIZE + rec.value.len();
            if total >= LEAF_SPLIT_TARGET {
                split = i;
                break;
            }
        }
        let upper = records.split_off(split);

        let new_leaf = self.alloc_page(trx, table)?;
        {
            let guard = self.pool.fetch_page_mut(table, leaf)?;
            let mut page = guard.write();
            let before = page.clone();
            page.leaf_repack(&records);
            page.set_sibling(new_leaf);
            self.log_page_image(trx, table, leaf, &before, &mut page)?;
        }
        let new_key = upper[0].key;
        {
            let guard = self.pool.fetch_page_mut(table, new_leaf)?;
            let mut page = guard.write();
            let before = page.clone();
            page.init_leaf();
            page.set_parent(parent);
            page.set_sibling(old_sibling);
            page.leaf_repack(&upper);
            self.log_page_image(trx, table, new_leaf, &before, &mut page)?;
        }
        debug!(
            "table {}: leaf {} split, {} moved to {}",
            table,
            leaf,
            upper.len(),
            new_leaf
        );
        self.insert_into_parent(trx, table, leaf, new_key, new_leaf)
    }

    /// Hang `right` (keyed from `key`) next to `left` in their parent,
    /// growing a new root when `left` was the root
    fn insert_into_parent(
        &self,
        trx: TrxId,
        table: TableId,
        left: PageId,
        key: i64,
        right: PageId,
    ) -> Result<()> {
        let parent = {
            let guard = self.pool.fetch_page(table, left)?;
            let __tmp = guard.read().parent();
            __tmp
        };
        if parent.is_nil() {
            return self.insert_into_new_root(trx, table, left, key, right);
        }

        let (left_index, num_keys) = {
            let guard = self.pool.fetch_page(table, parent)?;
            let page = guard.read();
            let left_index = page.internal_child_index(left).ok_or_else(|| {
                StorageError::corrupt(format!("page {left} not referenced by its parent {parent}"))
            })?;
            (left_index, page.num_keys())
        };

        if num_keys < ENTRY_CAPACITY {
            let guard = self.pool.fetch_page_mut(table, parent)?;
            let mut page = guard.write();
            let before = page.clone();
            page.internal_insert_at(left_index, key, right);
            self.log_page_image(trx, table, parent, &before, &mut page)
        } else {
            self.insert_into_page_split(trx, table, parent, left_index, key, right)
        }
    }

    /// Split a full internal page. The temp array is populated from
    /// the old page in full before the new entry is spliced in, then
    /// cut around the middle key, which moves up to the parent.
    fn insert_into_page_split(
        &self,
        trx: TrxId,
        table: TableId,
        old: PageId,
        left_index: usize,
        key: i64,
        right: PageId,
    ) -> Result<()> {
        let (mut entries, left_child, parent) = {
            let guard = self.pool.fetch_page(table, old)?;
            let page = guard.read();
            (page.internal_collect(), page.left_child(), page.parent())
        };
        entries.insert(left_index, Entry { key, child: right });
        debug_assert_eq!(entries.len(), ENTRY_CAPACITY + 1);

        let split = ENTRY_CAPACITY / 2 + 1;
        let upper = entries.split_off(split);
        let middle = entries
            .pop()
            .expect("split point leaves a middle entry");
        let k_prime = middle.key;

        let new_page = self.alloc_page(trx, table)?;
        {
            let guard = self.pool.fetch_page_mut(table, old)?;
            let mut page = guard.write();
            let before = page.clone();
            page.internal_repack(left_child, &entries);
            self.log_page_image(trx, table, old, &before, &mut page)?;
        }
        {
            let guard = self.pool.fetch_page_mut(table, new_page)?;
            let mut page = guard.write();
            let before = page.clone();
            page.init_internal();
            page.set_parent(parent);
            page.internal_repack(middle.child, &upper);
            self.log_page_image(trx, table, new_page, &before, &mut page)?;
        }

        // every child that moved now answers to the new page
        self.reparent(trx, table, middle.child, new_page)?;
        for entry in &upper {
            self.reparent(trx, table, entry.child, new_page)?;
        }
        debug!(
            "table {}: internal {} split at key {}, new page {}",
            table, old, k_prime, new_page
        );
        self.insert_into_parent(trx, table, old, k_prime, new_page)
    }

    /// Grow the tree by one level: a fresh internal root referencing
    /// `left` and `right` around `key`
    fn insert_into_new_root(
        &self,
        trx: TrxId,
        table: TableId,
        left: PageId,
        key: i64,
        right: PageId,
    ) -> Result<()> {
        let root = self.alloc_page(trx, table)?;
        {
            let guard = self.pool.fetch_page_mut(table, root)?;
            let mut page = guard.write();
            let before = page.clone();
            page.init_internal();
            page.set_left_child(left);
            page.internal_insert_at(0, key, right);
            self.log_page_image(trx, table, root, &before, &mut page)?;
        }
        self.reparent(trx, table, left, root)?;
        self.reparent(trx, table, right, root)?;
        self.set_root(trx, table, root)?;
        debug!("table {}: root split, new root {}", table, root);
        Ok(())
    }

    /// Point the table header at a new root page (logged)
    pub(crate) fn set_root(&self, trx: TrxId, table: TableId, root: PageId) -> Result<()> {
        let guard = self.pool.fetch_page_mut(table, PageId::HEADER)?;
        let mut header = guard.write();
        let before = header.clone();
        header.set_root_page(root);
        self.log_page_image(trx, table, PageId::HEADER, &before, &mut header)
    }
}
