//! Disk manager implementation.
//!
//! Each table is one file of fixed 4 KiB pages. Page 0 is the header
//! page; on creation the file is extended to 10 MiB and pages 1..2559
//! are threaded into the free list rooted in page 0. When the free
//! list runs dry the file doubles in size.
//!
//! The registry of open tables is persisted in a sidecar catalog file
//! (`<log_path>.tables`) so that recovery can resolve the table ids it
//! finds in the log back to files before any caller re-opens them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::types::{PageId, TableId, INITIAL_PAGE_COUNT, PAGE_SIZE};

struct Registry {
    files: HashMap<TableId, Arc<File>>,
    by_path: HashMap<PathBuf, TableId>,
    next_id: TableId,
}

/// File-backed page I/O device for every open table
pub struct DiskManager {
    catalog_path: PathBuf,
    inner: Mutex<Registry>,
}

impl DiskManager {
    /// Create a disk manager, reopening every table recorded in the
    /// catalog so recovery can reach them by id
    pub fn new(catalog_path: impl Into<PathBuf>) -> Result<Self> {
        let catalog_path = catalog_path.into();
        let mut registry = Registry {
            files: HashMap::new(),
            by_path: HashMap::new(),
            next_id: 1,
        };

        for (table_id, path) in load_catalog(&catalog_path)? {
            if !path.exists() {
                warn!("table {} missing on disk, skipping: {:?}", table_id, path);
                continue;
            }
            let file = open_table_file(&path)?;
            registry.files.insert(table_id, Arc::new(file));
            registry.by_path.insert(path, table_id);
            registry.next_id = registry.next_id.max(table_id + 1);
        }

        Ok(Self {
            catalog_path,
            inner: Mutex::new(registry),
        })
    }

    /// Open or create the table file at `path`, returning its id.
    /// Re-opening a registered path returns the existing id.
    pub fn open_table(&self, path: impl AsRef<Path>) -> Result<TableId> {
        let path = path.as_ref();
        let created = !path.exists();
        if created {
            create_table_file(path)?;
        }
        let path = path.canonicalize()?;

        let mut inner = self.inner.lock();
        if let Some(&table_id) = inner.by_path.get(&path) {
            return Ok(table_id);
        }

        let file = open_table_file(&path)?;
        if !created {
            let page = read_page_from(&file, PageId::HEADER)?;
            page.verify_header_page()?;
        }

        let table_id = inner.next_id;
        inner.next_id += 1;
        inner.files.insert(table_id, Arc::new(file));
        inner.by_path.insert(path.clone(), table_id);
        append_catalog(&self.catalog_path, table_id, &path)?;

        debug!("opened table {} at {:?}", table_id, path);
        Ok(table_id)
    }

    /// Read one page with a positional read
    pub fn read_page(&self, table_id: TableId, page_id: PageId) -> Result<Page> {
        let file = self.file(table_id)?;
        read_page_from(&file, page_id)
    }

    /// Write one page with a positional full-page write
    pub fn write_page(&self, table_id: TableId, page_id: PageId, page: &Page) -> Result<()> {
        let file = self.file(table_id)?;
        file.write_all_at(page.as_bytes(), page_id.file_offset(PAGE_SIZE))?;
        Ok(())
    }

    /// Flush a table's file contents to stable storage
    pub fn sync(&self, table_id: TableId) -> Result<()> {
        let file = self.file(table_id)?;
        file.sync_data()?;
        Ok(())
    }

    /// Flush every open table to stable storage
    pub fn sync_all(&self) -> Result<()> {
        let files: Vec<Arc<File>> = self.inner.lock().files.values().cloned().collect();
        for file in files {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Double the table file and thread the new pages into a free
    /// chain: `old .. 2*old-1`, last pointing nowhere.
    ///
    /// Returns the new page count. The chain head is not yet reachable
    /// from page 0; the caller links it under the write-ahead log. The
    /// extension is synced so a torn doubling only costs file space.
    pub fn extend(&self, table_id: TableId, old_pages: u64) -> Result<u64> {
        let file = self.file(table_id)?;
        let new_pages = old_pages * 2;
        file.set_len(new_pages * PAGE_SIZE as u64)?;
        thread_free_chain(&file, old_pages, new_pages)?;
        file.sync_data()?;
        debug!("extended table {} to {} pages", table_id, new_pages);
        Ok(new_pages)
    }

    fn file(&self, table_id: TableId) -> Result<Arc<File>> {
        self.inner
            .lock()
            .files
            .get(&table_id)
            .cloned()
            .ok_or_else(|| StorageError::corrupt(format!("table {table_id} is not open")))
    }
}

fn open_table_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Create a fresh 10 MiB table file: initialized header page and pages
/// 1..2559 threaded into the free list
fn create_table_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(INITIAL_PAGE_COUNT * PAGE_SIZE as u64)?;

    let mut header = Page::new();
    header.init_header_page(INITIAL_PAGE_COUNT, PageId::new(1));
    file.write_all_at(header.as_bytes(), 0)?;

    thread_free_chain(&file, 1, INITIAL_PAGE_COUNT)?;
    file.sync_all()?;
    Ok(())
}

/// Point each page in `[first, last_exclusive)` at its successor; the
/// final page keeps the zeroed nil pointer left by `set_len`
fn thread_free_chain(file: &File, first: u64, last_exclusive: u64) -> Result<()> {
    for pid in first..last_exclusive.saturating_sub(1) {
        let next = (pid + 1).to_be_bytes();
        file.write_all_at(&next, pid * PAGE_SIZE as u64)?;
    }
    Ok(())
}

fn read_page_from(file: &File, page_id: PageId) -> Result<Page> {
    let offset = page_id.file_offset(PAGE_SIZE);
    if offset + PAGE_SIZE as u64 > file.metadata()?.len() {
        return Err(StorageError::PageOutOfBounds(page_id));
    }
    let mut buf = [0u8; PAGE_SIZE];
    file.read_exact_at(&mut buf, offset)?;
    Ok(Page::from_bytes(&buf))
}

fn load_catalog(path: &Path) -> Result<Vec<(TableId, PathBuf)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut tables = Vec::new();
    for line in std::fs::read_to_string(path)?.lines() {
        let (id, table_path) = line
            .split_once('\t')
            .ok_or_else(|| StorageError::corrupt("malformed table catalog line"))?;
        let id: TableId = id
            .parse()
            .map_err(|_| StorageError::corrupt("malformed table id in catalog"))?;
        tables.push((id, PathBuf::from(table_path)));
    }
    Ok(tables)
}

fn append_catalog(path: &Path, table_id: TableId, table_path: &Path) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}\t{}", table_id, table_path.display())?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> DiskManager {
        DiskManager::new(dir.join("wal.tables")).unwrap()
    }

    #[test]
    fn test_create_new_table() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = manager(dir.path());

        let table = dm.open_table(dir.path().join("t1.db"))?;
        assert_eq!(table, 1);

        let header = dm.read_page(table, PageId::HEADER)?;
        header.verify_header_page()?;
        assert_eq!(header.num_pages(), INITIAL_PAGE_COUNT);
        assert_eq!(header.first_free_page(), PageId::new(1));
        assert!(header.root_page().is_nil());

        Ok(())
    }

    #[test]
    fn test_initial_free_chain_is_threaded() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = manager(dir.path());
        let table = dm.open_table(dir.path().join("t1.db"))?;

        // walk the chain from page 1 to its end
        let mut pid = PageId::new(1);
        let mut count = 0u64;
        while !pid.is_nil() {
            let page = dm.read_page(table, pid)?;
            pid = page.next_free();
            count += 1;
        }
        assert_eq!(count, INITIAL_PAGE_COUNT - 1);

        Ok(())
    }

    #[test]
    fn test_page_write_read_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = manager(dir.path());
        let table = dm.open_table(dir.path().join("t1.db"))?;

        let mut page = Page::new();
        page.init_leaf();
        page.leaf_insert(7, b"payload");
        dm.write_page(table, PageId::new(5), &page)?;

        let read = dm.read_page(table, PageId::new(5))?;
        assert!(read.is_leaf());
        assert_eq!(read.record_value(0), b"payload");

        Ok(())
    }

    #[test]
    fn test_reopen_returns_same_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = manager(dir.path());

        let a = dm.open_table(dir.path().join("t1.db"))?;
        let b = dm.open_table(dir.path().join("t2.db"))?;
        let a_again = dm.open_table(dir.path().join("t1.db"))?;
        assert_eq!(a, a_again);
        assert_ne!(a, b);

        Ok(())
    }

    #[test]
    fn test_catalog_survives_restart() -> Result<()> {
        let dir = tempdir().unwrap();
        let t1 = dir.path().join("t1.db");
        let t2 = dir.path().join("t2.db");

        {
            let dm = manager(dir.path());
            assert_eq!(dm.open_table(&t1)?, 1);
            assert_eq!(dm.open_table(&t2)?, 2);
        }

        // a fresh manager reopens both tables under their old ids
        let dm = manager(dir.path());
        let header = dm.read_page(2, PageId::HEADER)?;
        header.verify_header_page()?;
        assert_eq!(dm.open_table(&t1)?, 1);
        assert_eq!(dm.open_table(dir.path().join("t3.db"))?, 3);

        Ok(())
    }

    #[test]
    fn test_extension_doubles_and_threads() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = manager(dir.path());
        let table = dm.open_table(dir.path().join("t1.db"))?;

        let new_total = dm.extend(table, INITIAL_PAGE_COUNT)?;
        assert_eq!(new_total, INITIAL_PAGE_COUNT * 2);

        let mut pid = PageId::new(INITIAL_PAGE_COUNT);
        let mut count = 0u64;
        while !pid.is_nil() {
            let page = dm.read_page(table, pid)?;
            pid = page.next_free();
            count += 1;
        }
        assert_eq!(count, INITIAL_PAGE_COUNT);

        Ok(())
    }

    #[test]
    fn test_corrupt_header_detected() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t1.db");
        {
            let dm = manager(dir.path());
            dm.open_table(&path)?;
        }

        // flip a byte inside the checksummed header region
        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&[0xFF], 17)?;

        let dm = DiskManager::new(dir.path().join("other.tables")).unwrap();
        assert!(matches!(
            dm.open_table(&path),
            Err(StorageError::Corrupt(_))
        ));

        Ok(())
    }
}
