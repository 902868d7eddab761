//! B+tree deletion: slot removal, leaf and internal merge or
//! redistribution, root collapse.
//!
//! Like insertion, `delete` is autocommit inside an internal
//! transaction. It also takes the record's exclusive lock first, so a
//! delete queues behind live transactions holding the record instead
//! of racing them.

use log::debug;

use crate::error::{Result, StorageError};
use crate::lock::{LockMode, RecordId};
use crate::page::Entry;
use crate::types::{
    PageId, TableId, TrxId, ENTRY_CAPACITY, ENTRY_UNDERFLOW, LEAF_MERGE_THRESHOLD, LEAF_SPACE,
};

use super::tree::BTree;

/// Which neighbor rebalancing works against: the left sibling when
/// one exists, otherwise the right
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sibling {
    Left { k_prime_index: usize },
    Right,
}

impl Sibling {
    fn k_prime_index(self) -> usize {
        match self {
            Sibling::Left { k_prime_index } => k_prime_index,
            Sibling::Right => 0,
        }
    }
}

impl BTree {
    /// Delete `key`, returning whether it existed
    pub fn delete(&self, table: TableId, key: i64) -> Result<bool> {
        let _latch = self.latch.lock();
        let trx = self.trxs.begin();
        match self.delete_tree(trx, table, key) {
            Ok(found) => {
                self.trxs.commit(trx)?;
                Ok(found)
            }
            Err(err) => {
                self.trxs.abort(trx, &self.pool)?;
                Err(err)
            }
        }
    }

    fn delete_tree(&self, trx: TrxId, table: TableId, key: i64) -> Result<bool> {
        let leaf = match self.find_leaf(table, key)? {
            Some(leaf) => leaf,
            None => return Ok(false),
        };
        let slot = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let __tmp = guard.read().leaf_search(key);
            __tmp
        };
        let slot = match slot {
            Some(slot) => slot,
            None => return Ok(false),
        };

        // queue behind any transaction still holding the record
        self.locks.acquire(
            RecordId {
                table_id: table,
                page_id: leaf,
                slot: slot as u16,
            },
            trx,
            LockMode::Exclusive,
        )?;

        {
            let guard = self.pool.fetch_page_mut(table, leaf)?;
            let mut page = guard.write();
            let index = match page.leaf_search(key) {
                Some(index) => index,
                None => return Ok(false),
            };
            let before = page.clone();
            page.leaf_remove(index);
            debug_assert!(page.leaf_accounting_ok());
            self.log_page_image(trx, table, leaf, &before, &mut page)?;
        }
        debug!("table {}: deleted key {} from leaf {}", table, key, leaf);

        self.rebalance_leaf(trx, table, leaf)?;
        Ok(true)
    }

    /// After a removal, merge or redistribute an underfull leaf; an
    /// emptied root clears the tree
    fn rebalance_leaf(&self, trx: TrxId, table: TableId, leaf: PageId) -> Result<()> {
        let (parent, num_keys, free_space) = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let page = guard.read();
            (page.parent(), page.num_keys(), page.free_space())
        };

        if parent.is_nil() {
            if num_keys > 0 {
                return Ok(());
            }
            return self.end_tree(trx, table, leaf);
        }
        if free_space < LEAF_MERGE_THRESHOLD {
            return Ok(());
        }

        let (sibling, sibling_pid, k_prime) = self.pick_sibling(table, parent, leaf)?;
        let sibling_free = {
            let guard = self.pool.fetch_page(table, sibling_pid)?;
            let __tmp = guard.read().free_space();
            __tmp
        };

        if sibling_free + free_space >= LEAF_SPACE {
            self.merge_leaves(trx, table, leaf, sibling_pid, sibling, k_prime)
        } else {
            self.redistribute_leaves(trx, table, leaf, sibling_pid, sibling)
        }
    }

    /// Locate the preferred sibling of `pid` under `parent` and the
    /// separator key (`k_prime`) between them
    fn pick_sibling(
        &self,
        table: TableId,
        parent: PageId,
        pid: PageId,
    ) -> Result<(Sibling, PageId, i64)> {
        let guard = self.pool.fetch_page(table, parent)?;
        let page = guard.read();
        let child_index = page.internal_child_index(pid).ok_or_else(|| {
            StorageError::corrupt(format!("page {pid} not referenced by its parent {parent}"))
        })?;

        // a left neighbor is preferred; the leftmost child falls back
        // to its right neighbor
        let (sibling, sibling_pid) = if child_index == 0 {
            (Sibling::Right, page.entry(0).child)
        } else if child_index == 1 {
            (
                Sibling::Left { k_prime_index: 0 },
                page.left_child(),
            )
        } else {
            (
                Sibling::Left {
                    k_prime_index: child_index - 1,
                },
                page.entry(child_index - 2).child,
            )
        };
        let k_prime = page.entry(sibling.k_prime_index()).key;
        Ok((sibling, sibling_pid, k_prime))
    }

    /// Merge two neighboring leaves into the left one and drop the
    /// right from the parent
    fn merge_leaves(
        &self,
        trx: TrxId,
        table: TableId,
        leaf: PageId,
        sibling_pid: PageId,
        sibling: Sibling,
        k_prime: i64,
    ) -> Result<()> {
        let (left, right) = match sibling {
            Sibling::Left { .. } => (sibling_pid, leaf),
            Sibling::Right => (leaf, sibling_pid),
        };

        let (mut records, right_sibling) = {
            let guard = self.pool.fetch_page(table, right)?;
            let page = guard.read();
            (page.leaf_collect(), page.sibling())
        };
        let parent = {
            let guard = self.pool.fetch_page_mut(table, left)?;
            let mut page = guard.write();
            let before = page.clone();
            let mut merged = page.leaf_collect();
            merged.append(&mut records);
            page.leaf_repack(&merged);
            page.set_sibling(right_sibling);
            debug_assert!(page.leaf_accounting_ok());
            self.log_page_image(trx, table, left, &before, &mut page)?;
            page.parent()
        };
        debug!("table {}: merged leaf {} into {}", table, right, left);

        self.delete_from_child(trx, table, parent, k_prime, right)
    }

    /// Rotate records from the sibling until the leaf is filled past
    /// the threshold again, then fix the parent's separator
    fn redistribute_leaves(
        &self,
        trx: TrxId,
        table: TableId,
        leaf: PageId,
        sibling_pid: PageId,
        sibling: Sibling,
    ) -> Result<()> {
        let mut leaf_records = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let __tmp = guard.read().leaf_collect();
            __tmp
        };
        let mut sibling_records = {
            let guard = self.pool.fetch_page(table, sibling_pid)?;
            let __tmp = guard.read().leaf_collect();
            __tmp
        };

        let mut leaf_free = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let __tmp = guard.read().free_space();
            __tmp
        };
        while leaf_free >= LEAF_MERGE_THRESHOLD && !sibling_records.is_empty() {
            let moved = match sibling {
                Sibling::Left { .. } => {
                    let rec = sibling_records.pop().unwrap();
                    leaf_records.insert(0, rec);
                    &leaf_records[0]
                }
                Sibling::Right => {
                    let rec = sibling_records.remove(0);
                    leaf_records.push(rec);
                    leaf_records.last().unwrap()
                }
            };
            leaf_free -= crate::types::SLOT_SIZE + moved.value.len();
        }

        {
            let guard = self.pool.fetch_page_mut(table, leaf)?;
            let mut page = guard.write();
            let before = page.clone();
            page.leaf_repack(&leaf_records);
            debug_assert!(page.leaf_accounting_ok());
            self.log_page_image(trx, table, leaf, &before, &mut page)?;
        }
        {
            let guard = self.pool.fetch_page_mut(table, sibling_pid)?;
            let mut page = guard.write();
            let before = page.clone();
            page.leaf_repack(&sibling_records);
            debug_assert!(page.leaf_accounting_ok());
            self.log_page_image(trx, table, sibling_pid, &before, &mut page)?;
        }

        // the separator between the two now starts the right-hand page
        let parent = {
            let guard = self.pool.fetch_page(table, leaf)?;
            let __tmp = guard.read().parent();
            __tmp
        };
        let new_separator = match sibling {
            Sibling::Left { .. } => leaf_records[0].key,
            Sibling::Right => sibling_records[0].key,
        };
        {
            let guard = self.pool.fetch_page_mut(table, parent)?;
            let mut page = guard.write();
            let before = page.clone();
            page.set_entry_key(sibling.k_prime_index(), new_separator);
            self.log_page_image(trx, table, parent, &before, &mut page)?;
        }
        debug!(
            "table {}: redistributed leaves {} / {}, separator now {}",
            table, leaf, sibling_pid, new_separator
        );
        Ok(())
    }

    /// Remove the separator `key` and freed child from an internal
    /// page, then rebalance it in turn
    fn delete_from_child(
        &self,
        trx: TrxId,
        table: TableId,
        page_pid: PageId,
        key: i64,
        child: PageId,
    ) -> Result<()> {
        {
            let guard = self.pool.fetch_page_mut(table, page_pid)?;
            let mut page = guard.write();
            let before = page.clone();
            page.internal_remove(key, child);
            self.log_page_image(trx, table, page_pid, &before, &mut page)?;
        }
        self.free_page(trx, table, child)?;

        let (parent, num_keys) = {
            let guard = self.pool.fetch_page(table, page_pid)?;
            let page = guard.read();
            (page.parent(), page.num_keys())
        };

        if parent.is_nil() {
            if num_keys > 0 {
                return Ok(());
            }
            return self.adjust_root(trx, table, page_pid);
        }
        if num_keys >= ENTRY_UNDERFLOW {
            return Ok(());
        }

        let (sibling, sibling_pid, k_prime) = self.pick_sibling(table, parent, page_pid)?;
        let sibling_keys = {
            let guard = self.pool.fetch_page(table, sibling_pid)?;
            let __tmp = guard.read().num_keys();
            __tmp
        };

        if sibling_keys + num_keys < ENTRY_CAPACITY {
            self.merge_pages(trx, table, page_pid, sibling_pid, sibling, k_prime)
        } else {
            self.redistribute_pages(trx, table, page_pid, sibling_pid, sibling, k_prime)
        }
    }

    /// Merge two neighboring internal pages into the left one,
    /// pulling `k_prime` down as the separator between their children
    fn merge_pages(
        &self,
        trx: TrxId,
        table: TableId,
        page_pid: PageId,
        sibling_pid: PageId,
        sibling: Sibling,
        k_prime: i64,
    ) -> Result<()> {
        let (left, right) = match sibling {
            Sibling::Left { .. } => (sibling_pid, page_pid),
            Sibling::Right => (page_pid, sibling_pid),
        };

        let (right_entries, right_left_child) = {
            let guard = self.pool.fetch_page(table, right)?;
            let page = guard.read();
            (page.internal_collect(), page.left_child())
        };
        let parent = {
            let guard = self.pool.fetch_page_mut(table, left)?;
            let mut page = guard.write();
            let before = page.clone();
            let num_keys = page.num_keys();
            page.set_entry(
                num_keys,
                Entry {
                    key: k_prime,
                    child: right_left_child,
                },
            );
            for (i, entry) in right_entries.iter().enumerate() {
                page.set_entry(num_keys + 1 + i, *entry);
            }
            page.set_num_keys(num_keys + 1 + right_entries.len());
            self.log_page_image(trx, table, left, &before, &mut page)?;
            page.parent()
        };

        // children that moved over now answer to the left page
        self.reparent(trx, table, right_left_child, left)?;
        for entry in &right_entries {
            self.reparent(trx, table, entry.child, left)?;
        }
        debug!("table {}: merged internal {} into {}", table, right, left);

        self.delete_from_child(trx, table, parent, k_prime, right)
    }

    /// Rotate one entry through the parent from the fuller sibling
    fn redistribute_pages(
        &self,
        trx: TrxId,
        table: TableId,
        page_pid: PageId,
        sibling_pid: PageId,
        sibling: Sibling,
        k_prime: i64,
    ) -> Result<()> {
        let parent = {
            let guard = self.pool.fetch_page(table, page_pid)?;
            let __tmp = guard.read().parent();
            __tmp
        };

        let (moved_child, new_separator) = match sibling {
            Sibling::Left { .. } => {
                // sibling's last child slides in at the front
                let (last_entry, sibling_entries, sibling_left) = {
                    let guard = self.pool.fetch_page(table, sibling_pid)?;
                    let page = guard.read();
                    let entries = page.internal_collect();
                    (*entries.last().unwrap(), entries, page.left_child())
                };
                {
                    let guard = self.pool.fetch_page_mut(table, page_pid)?;
                    let mut page = guard.write();
                    let before = page.clone();
                    let old_left = page.left_child();
                    let mut entries = page.internal_collect();
                    entries.insert(
                        0,
                        Entry {
                            key: k_prime,
                            child: old_left,
                        },
                    );
                    page.internal_repack(last_entry.child, &entries);
                    self.log_page_image(trx, table, page_pid, &before, &mut page)?;
                }
                {
                    let guard = self.pool.fetch_page_mut(table, sibling_pid)?;
                    let mut page = guard.write();
                    let before = page.clone();
                    let entries = &sibling_entries[..sibling_entries.len() - 1];
                    page.internal_repack(sibling_left, entries);
                    self.log_page_image(trx, table, sibling_pid, &before, &mut page)?;
                }
                (last_entry.child, last_entry.key)
            }
            Sibling::Right => {
                // sibling's leftmost child slides in at the back
                let (sibling_entries, sibling_left) = {
                    let guard = self.pool.fetch_page(table, sibling_pid)?;
                    let page = guard.read();
                    (page.internal_collect(), page.left_child())
                };
                {
                    let guard = self.pool.fetch_page_mut(table, page_pid)?;
                    let mut page = guard.write();
                    let before = page.clone();
                    let num_keys = page.num_keys();
                    page.set_entry(
                        num_keys,
                        Entry {
                            key: k_prime,
                            child: sibling_left,
                        },
                    );
                    page.set_num_keys(num_keys + 1);
                    self.log_page_image(trx, table, page_pid, &before, &mut page)?;
                }
                {
                    let guard = self.pool.fetch_page_mut(table, sibling_pid)?;
                    let mut page = guard.write();
                    let before = page.clone();
                    let new_left = sibling_entries[0].child;
                    page.internal_repack(new_left, &sibling_entries[1..]);
                    self.log_page_image(trx, table, sibling_pid, &before, &mut page)?;
                }
                (sibling_left, sibling_entries[0].key)
            }
        };

        self.reparent(trx, table, moved_child, page_pid)?;
        {
            let guard = self.pool.fetch_page_mut(table, parent)?;
            let mut page = guard.write();
            let before = page.clone();
            page.set_entry_key(sibling.k_prime_index(), new_separator);
            self.log_page_image(trx, table, parent, &before, &mut page)?;
        }
        debug!(
            "table {}: rotated one entry between internal {} and {}",
            table, page_pid, sibling_pid
        );
        Ok(())
    }

    /// The root leaf emptied out: clear the tree and free the page
    fn end_tree(&self, trx: TrxId, table: TableId, root: PageId) -> Result<()> {
        self.set_root(trx, table, PageId::NIL)?;
        self.free_page(trx, table, root)?;
        debug!("table {}: tree emptied", table);
        Ok(())
    }

    /// The internal root lost its last separator: promote its sole
    /// remaining child
    fn adjust_root(&self, trx: TrxId, table: TableId, root: PageId) -> Result<()> {
        let new_root = {
            let guard = self.pool.fetch_page(table, root)?;
            let __tmp = guard.read().left_child();
            __tmp
        };
        self.reparent(trx, table, new_root, PageId::NIL)?;
        self.set_root(trx, table, new_root)?;
        self.free_page(trx, table, root)?;
        debug!("table {}: root collapsed to {}", table, new_root);
        Ok(())
    }
}
