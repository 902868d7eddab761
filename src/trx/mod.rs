//! Transaction manager.
//!
//! Owns the process-wide transaction table and the commit/abort
//! protocol. Abort walks the transaction's `last_lsn → prev_lsn`
//! chain, restores before-images through the buffer pool, and emits
//! one compensation record per undone update before the final
//! ROLLBACK. Recovery reuses the same chain walk for its undo pass.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::error::{Result, StorageError};
use crate::lock::LockManager;
use crate::page::Page;
use crate::types::{Lsn, TrxId, PAGE_HEADER_SIZE};
use crate::wal::{LogManager, PageUpdate, RecordBody};

/// State of a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    Active,
    Aborted,
    Committed,
}

struct TrxEntry {
    state: TrxState,
    last_lsn: Lsn,
}

struct TrxInner {
    next_id: TrxId,
    table: HashMap<TrxId, TrxEntry>,
}

/// Process-wide transaction table and lifecycle
pub struct TrxManager {
    wal: Arc<LogManager>,
    locks: Arc<LockManager>,
    inner: Mutex<TrxInner>,
}

impl TrxManager {
    pub fn new(wal: Arc<LogManager>, locks: Arc<LockManager>) -> Self {
        Self {
            wal,
            locks,
            inner: Mutex::new(TrxInner {
                next_id: 1,
                table: HashMap::new(),
            }),
        }
    }

    /// Start a transaction: assign an id and log BEGIN
    pub fn begin(&self) -> TrxId {
        let mut inner = self.inner.lock();
        let trx = inner.next_id;
        inner.next_id += 1;
        let lsn = self.wal.append(0, trx, RecordBody::Begin);
        inner.table.insert(
            trx,
            TrxEntry {
                state: TrxState::Active,
                last_lsn: lsn,
            },
        );
        debug!("trx {} began at lsn {}", trx, lsn);
        trx
    }

    /// Make future transaction ids start at `next` (recovery reseeds
    /// the counter past every id seen in the log)
    pub fn reseed(&self, next: TrxId) {
        let mut inner = self.inner.lock();
        inner.next_id = inner.next_id.max(next);
    }

    pub fn is_active(&self, trx: TrxId) -> bool {
        self.inner
            .lock()
            .table
            .get(&trx)
            .map_or(false, |e| e.state == TrxState::Active)
    }

    /// Last LSN written by an active transaction
    pub fn last_lsn(&self, trx: TrxId) -> Result<Lsn> {
        let inner = self.inner.lock();
        match inner.table.get(&trx) {
            Some(entry) if entry.state == TrxState::Active => Ok(entry.last_lsn),
            _ => Err(StorageError::TrxInactive(trx)),
        }
    }

    /// Append an UPDATE record for `trx`, chaining it onto the trx's
    /// previous record, and return its LSN
    pub fn append_update(&self, trx: TrxId, update: PageUpdate) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let entry = match inner.table.get_mut(&trx) {
            Some(entry) if entry.state == TrxState::Active => entry,
            _ => return Err(StorageError::TrxInactive(trx)),
        };
        let lsn = self
            .wal
            .append(entry.last_lsn, trx, RecordBody::Update(update));
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    /// Commit: log COMMIT, flush the log through it, release all locks
    pub fn commit(&self, trx: TrxId) -> Result<()> {
        let commit_lsn = {
            let mut inner = self.inner.lock();
            let entry = match inner.table.get_mut(&trx) {
                Some(entry) if entry.state == TrxState::Active => entry,
                _ => return Err(StorageError::TrxInactive(trx)),
            };
            let lsn = self.wal.append(entry.last_lsn, trx, RecordBody::Commit);
            entry.state = TrxState::Committed;
            lsn
        };

        self.wal.flush_to(commit_lsn)?;
        self.locks.release_all(trx);
        self.inner.lock().table.remove(&trx);
        debug!("trx {} committed at lsn {}", trx, commit_lsn);
        Ok(())
    }

    /// Abort: undo the transaction's updates through the buffer pool,
    /// log ROLLBACK, flush, release all locks
    pub fn abort(&self, trx: TrxId, pool: &BufferPool) -> Result<()> {
        let last_lsn = {
            let mut inner = self.inner.lock();
            let entry = match inner.table.get_mut(&trx) {
                Some(entry) if entry.state == TrxState::Active => entry,
                _ => return Err(StorageError::TrxInactive(trx)),
            };
            entry.state = TrxState::Aborted;
            entry.last_lsn
        };

        let last_lsn = rollback_chain(&self.wal, pool, trx, last_lsn, true)?;
        let rollback_lsn = self.wal.append(last_lsn, trx, RecordBody::Rollback);
        self.wal.flush_to(rollback_lsn)?;
        self.locks.release_all(trx);
        self.inner.lock().table.remove(&trx);
        debug!("trx {} rolled back at lsn {}", trx, rollback_lsn);
        Ok(())
    }
}

/// Undo a transaction's updates from `last_lsn` back to its BEGIN,
/// emitting a CLR per undone update. Returns the LSN to chain the
/// closing ROLLBACK onto.
///
/// `check_tag` enables the slot trx-id guard used by live aborts: a
/// value-range image is only restored while the slot at that offset is
/// still tagged by the aborting transaction (a concurrent structural
/// change may have moved the record). Recovery undo passes `false` and
/// restores unconditionally, since redo has already repeated history.
pub(crate) fn rollback_chain(
    wal: &LogManager,
    pool: &BufferPool,
    trx: TrxId,
    mut last_lsn: Lsn,
    check_tag: bool,
) -> Result<Lsn> {
    let mut cursor = last_lsn;
    loop {
        let record = wal.record_at(cursor)?;
        match record.body {
            RecordBody::Begin => break,
            RecordBody::Clr { next_undo_lsn, .. } => {
                // already compensated past this point
                if next_undo_lsn == 0 {
                    break;
                }
                cursor = next_undo_lsn;
            }
            RecordBody::Update(update) => {
                last_lsn = undo_update(wal, pool, trx, last_lsn, record.prev_lsn, &update, check_tag)?;
                cursor = record.prev_lsn;
            }
            RecordBody::Commit | RecordBody::Rollback => {
                return Err(StorageError::corrupt(format!(
                    "undo of trx {trx} ran into a completion record at lsn {cursor}"
                )));
            }
        }
    }
    Ok(last_lsn)
}

fn undo_update(
    wal: &LogManager,
    pool: &BufferPool,
    trx: TrxId,
    last_lsn: Lsn,
    next_undo_lsn: Lsn,
    update: &PageUpdate,
    check_tag: bool,
) -> Result<Lsn> {
    let guard = pool.fetch_page_mut(update.table_id, update.page_id)?;
    let mut page = guard.write();

    let restore = if check_tag && update.offset as usize >= PAGE_HEADER_SIZE {
        // value-range undo: only while this trx still owns the slot
        match slot_at_offset(&page, update.offset) {
            Some(index) if page.slot(index).trx_id == trx as i32 => {
                page.set_slot_trx(index, 0);
                true
            }
            _ => {
                debug!(
                    "skipping undo of moved record at {}:{} offset {}",
                    update.table_id, update.page_id, update.offset
                );
                false
            }
        }
    } else {
        true
    };

    if restore {
        page.write_range(update.offset as usize, &update.before);
    }

    let clr = RecordBody::Clr {
        update: PageUpdate {
            table_id: update.table_id,
            page_id: update.page_id,
            offset: update.offset,
            size: update.size,
            before: update.after.clone(),
            after: update.before.clone(),
        },
        next_undo_lsn,
    };
    let clr_lsn = wal.append(last_lsn, trx, clr);
    page.set_page_lsn(clr_lsn);
    Ok(clr_lsn)
}

/// Find the leaf slot whose value starts at `offset`
fn slot_at_offset(page: &Page, offset: u16) -> Option<usize> {
    if !page.is_leaf() {
        return None;
    }
    (0..page.num_keys()).find(|&i| page.slot(i).offset == offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskManager;
    use crate::types::PageId;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        table: i64,
        pool: BufferPool,
        wal: Arc<LogManager>,
        trxs: TrxManager,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("wal.tables")).unwrap());
        let wal = Arc::new(LogManager::open(dir.path().join("wal")).unwrap());
        let locks = Arc::new(LockManager::new());
        let table = disk.open_table(dir.path().join("t1.db")).unwrap();
        let pool = BufferPool::new(disk, Arc::clone(&wal), 8);
        let trxs = TrxManager::new(Arc::clone(&wal), locks);
        Fixture {
            _dir: dir,
            table,
            pool,
            wal,
            trxs,
        }
    }

    /// Seed page 1 as a leaf with one record and return its value
    /// offset
    fn seed_record(fx: &Fixture, value: &[u8]) -> u16 {
        let guard = fx.pool.fetch_page_mut(fx.table, PageId::new(1)).unwrap();
        let mut page = guard.write();
        page.init_leaf();
        page.leaf_insert(42, value);
        page.slot(0).offset
    }

    /// Log and apply one value update the way db_update does
    fn apply_update(fx: &Fixture, trx: TrxId, offset: u16, before: &[u8], after: &[u8]) {
        let lsn = fx
            .trxs
            .append_update(
                trx,
                PageUpdate {
                    table_id: fx.table,
                    page_id: PageId::new(1),
                    offset,
                    size: before.len() as u16,
                    before: before.to_vec(),
                    after: after.to_vec(),
                },
            )
            .unwrap();
        let guard = fx.pool.fetch_page_mut(fx.table, PageId::new(1)).unwrap();
        let mut page = guard.write();
        page.set_slot_trx(0, trx as i32);
        page.write_range(offset as usize, after);
        page.set_page_lsn(lsn);
    }

    #[test]
    fn test_begin_commit_lifecycle() -> Result<()> {
        let fx = setup();
        let trx = fx.trxs.begin();
        assert!(fx.trxs.is_active(trx));

        fx.trxs.commit(trx)?;
        assert!(!fx.trxs.is_active(trx));
        // commit is durable
        let records = fx.wal.scan()?;
        assert_eq!(records.last().unwrap().body, RecordBody::Commit);

        // a second commit is rejected
        assert!(matches!(
            fx.trxs.commit(trx),
            Err(StorageError::TrxInactive(_))
        ));
        Ok(())
    }

    #[test]
    fn test_abort_restores_before_image() -> Result<()> {
        let fx = setup();
        let offset = seed_record(&fx, b"before!!");

        let trx = fx.trxs.begin();
        apply_update(&fx, trx, offset, b"before!!", b"after!!!");
        fx.trxs.abort(trx, &fx.pool)?;

        let guard = fx.pool.fetch_page(fx.table, PageId::new(1))?;
        let page = guard.read();
        assert_eq!(page.record_value(0), b"before!!");
        assert_eq!(page.slot(0).trx_id, 0);
        Ok(())
    }

    #[test]
    fn test_triple_update_abort_leaves_three_clrs() -> Result<()> {
        let fx = setup();
        let offset = seed_record(&fx, b"v0");

        let trx = fx.trxs.begin();
        apply_update(&fx, trx, offset, b"v0", b"v1");
        apply_update(&fx, trx, offset, b"v1", b"v2");
        apply_update(&fx, trx, offset, b"v2", b"v3");
        fx.trxs.abort(trx, &fx.pool)?;

        let guard = fx.pool.fetch_page(fx.table, PageId::new(1))?;
        assert_eq!(guard.read().record_value(0), b"v0");
        drop(guard);

        // log tail: ... UPDATE UPDATE UPDATE CLR CLR CLR ROLLBACK
        let records = fx.wal.scan()?;
        let tail: Vec<&str> = records.iter().rev().take(4).map(|r| r.kind_name()).collect();
        assert_eq!(tail, vec!["ROLLBACK", "CLR", "CLR", "CLR"]);

        // CLRs undo in reverse order: v3→v2, v2→v1, v1→v0
        let clrs: Vec<_> = records
            .iter()
            .filter_map(|r| match &r.body {
                RecordBody::Clr { update, .. } => Some(update.after.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(clrs, vec![b"v2".to_vec(), b"v1".to_vec(), b"v0".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_undo_skips_moved_record() -> Result<()> {
        let fx = setup();
        let offset = seed_record(&fx, b"keep-me!");

        let trx = fx.trxs.begin();
        apply_update(&fx, trx, offset, b"keep-me!", b"clobber!");

        // another writer re-tags the slot, as a structural move would
        {
            let guard = fx.pool.fetch_page_mut(fx.table, PageId::new(1))?;
            guard.write().set_slot_trx(0, 999);
        }

        fx.trxs.abort(trx, &fx.pool)?;

        // the before-image was not restored
        let guard = fx.pool.fetch_page(fx.table, PageId::new(1))?;
        assert_eq!(guard.read().record_value(0), b"clobber!");
        Ok(())
    }
}
