//! Internal page operations.
//!
//! An internal page holds a sorted fixed-width array of
//! `{key, child}` entries plus `left_child` in the header for keys
//! below `entries[0].key`. Entry `i`'s child covers keys in
//! `[entries[i].key, entries[i+1].key)`.

use crate::types::{PageId, ENTRY_SIZE, PAGE_HEADER_SIZE};

use super::Page;

/// One separator entry of an internal page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub key: i64,
    pub child: PageId,
}

fn entry_base(index: usize) -> usize {
    PAGE_HEADER_SIZE + index * ENTRY_SIZE
}

impl Page {
    pub fn entry(&self, index: usize) -> Entry {
        debug_assert!(index < self.num_keys());
        let base = entry_base(index);
        Entry {
            key: self.read_i64(base),
            child: self.read_pid(base + 8),
        }
    }

    pub fn set_entry(&mut self, index: usize, entry: Entry) {
        let base = entry_base(index);
        self.write_i64(base, entry.key);
        self.write_pid(base + 8, entry.child);
    }

    pub fn set_entry_key(&mut self, index: usize, key: i64) {
        self.write_i64(entry_base(index), key);
    }

    /// Child to descend into when looking for `key`
    pub fn internal_find_child(&self, key: i64) -> PageId {
        let mut i = 0;
        while i < self.num_keys() && key >= self.read_i64(entry_base(i)) {
            i += 1;
        }
        if i == 0 {
            self.left_child()
        } else {
            self.entry(i - 1).child
        }
    }

    /// Index of `child` among this page's child pointers:
    /// 0 for `left_child`, `i + 1` for `entries[i].child`
    pub fn internal_child_index(&self, child: PageId) -> Option<usize> {
        if self.left_child() == child {
            return Some(0);
        }
        (0..self.num_keys())
            .find(|&i| self.entry(i).child == child)
            .map(|i| i + 1)
    }

    /// Insert `(key, child)` at entry index `left_index`, shifting the
    /// entries above it
    pub fn internal_insert_at(&mut self, left_index: usize, key: i64, child: PageId) {
        let num_keys = self.num_keys();
        for i in (left_index..num_keys).rev() {
            let entry = self.entry(i);
            self.set_entry(i + 1, entry);
        }
        self.set_entry(left_index, Entry { key, child });
        self.set_num_keys(num_keys + 1);
    }

    /// Materialize every entry in key order
    pub fn internal_collect(&self) -> Vec<Entry> {
        (0..self.num_keys()).map(|i| self.entry(i)).collect()
    }

    /// Rebuild this page from `left_child` and `entries`, preserving
    /// the parent link
    pub fn internal_repack(&mut self, left_child: PageId, entries: &[Entry]) {
        let parent = self.parent();
        let lsn = self.page_lsn();
        self.init_internal();
        self.set_parent(parent);
        self.set_page_lsn(lsn);
        self.set_left_child(left_child);
        for (i, entry) in entries.iter().enumerate() {
            self.set_entry(i, *entry);
        }
        self.set_num_keys(entries.len());
    }

    /// Remove the separator `key` and the pointer to `child`,
    /// collapsing the remaining keys and children around them
    pub fn internal_remove(&mut self, key: i64, child: PageId) {
        let mut keys: Vec<i64> = (0..self.num_keys()).map(|i| self.entry(i).key).collect();
        let mut children: Vec<PageId> = std::iter::once(self.left_child())
            .chain((0..self.num_keys()).map(|i| self.entry(i).child))
            .collect();

        keys.retain(|&k| k != key);
        children.retain(|&c| c != child);
        debug_assert_eq!(keys.len() + 1, children.len());

        let entries: Vec<Entry> = keys
            .iter()
            .zip(children.iter().skip(1))
            .map(|(&key, &child)| Entry { key, child })
            .collect();
        self.internal_repack(children[0], &entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal_with(left: u64, pairs: &[(i64, u64)]) -> Page {
        let mut page = Page::new();
        page.init_internal();
        page.set_left_child(PageId::new(left));
        for (i, &(key, child)) in pairs.iter().enumerate() {
            page.set_entry(
                i,
                Entry {
                    key,
                    child: PageId::new(child),
                },
            );
        }
        page.set_num_keys(pairs.len());
        page
    }

    #[test]
    fn test_find_child_ranges() {
        let page = internal_with(100, &[(10, 110), (20, 120), (30, 130)]);

        assert_eq!(page.internal_find_child(5), PageId::new(100));
        assert_eq!(page.internal_find_child(10), PageId::new(110));
        assert_eq!(page.internal_find_child(19), PageId::new(110));
        assert_eq!(page.internal_find_child(20), PageId::new(120));
        assert_eq!(page.internal_find_child(99), PageId::new(130));
    }

    #[test]
    fn test_child_index() {
        let page = internal_with(100, &[(10, 110), (20, 120)]);
        assert_eq!(page.internal_child_index(PageId::new(100)), Some(0));
        assert_eq!(page.internal_child_index(PageId::new(110)), Some(1));
        assert_eq!(page.internal_child_index(PageId::new(120)), Some(2));
        assert_eq!(page.internal_child_index(PageId::new(999)), None);
    }

    #[test]
    fn test_insert_at_shifts_entries() {
        let mut page = internal_with(100, &[(10, 110), (30, 130)]);
        page.internal_insert_at(1, 20, PageId::new(120));

        assert_eq!(page.num_keys(), 3);
        assert_eq!(page.entry(0).key, 10);
        assert_eq!(page.entry(1).key, 20);
        assert_eq!(page.entry(1).child, PageId::new(120));
        assert_eq!(page.entry(2).key, 30);
    }

    #[test]
    fn test_remove_middle_entry() {
        let mut page = internal_with(100, &[(10, 110), (20, 120), (30, 130)]);
        page.internal_remove(20, PageId::new(120));

        assert_eq!(page.num_keys(), 2);
        assert_eq!(page.left_child(), PageId::new(100));
        assert_eq!(page.entry(0), Entry { key: 10, child: PageId::new(110) });
        assert_eq!(page.entry(1), Entry { key: 30, child: PageId::new(130) });
    }

    #[test]
    fn test_remove_left_child() {
        let mut page = internal_with(100, &[(10, 110), (20, 120)]);
        page.internal_remove(10, PageId::new(100));

        assert_eq!(page.num_keys(), 1);
        assert_eq!(page.left_child(), PageId::new(110));
        assert_eq!(page.entry(0), Entry { key: 20, child: PageId::new(120) });
    }
}
