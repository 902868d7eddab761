//! Record-level lock manager.
//!
//! Locks are keyed by `(table, page, slot)` and come in shared and
//! exclusive modes. Each record's bucket holds granted and waiting
//! entries in arrival order. A request that conflicts with a granted
//! holder parks on a condvar unless granting it would close a cycle
//! in the wait-for graph, in which case the caller must abort its
//! transaction. Strict two-phase locking: locks are only released at
//! commit or abort, all at once.

mod wait_graph;

use std::collections::HashMap;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StorageError};
use crate::types::{PageId, TableId, TrxId};

use wait_graph::WaitForGraph;

/// Identity of one lockable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub table_id: TableId,
    pub page_id: PageId,
    pub slot: u16,
}

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockEntry {
    trx_id: TrxId,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct LockInner {
    buckets: HashMap<RecordId, Vec<LockEntry>>,
    /// Records each transaction holds, pushed in acquisition order
    held: HashMap<TrxId, Vec<RecordId>>,
}

/// Process-wide lock table
pub struct LockManager {
    inner: Mutex<LockInner>,
    wakeup: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockInner::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Acquire `mode` on `record` for `trx`, blocking while conflicting
    /// holders exist. Returns `Deadlock` if waiting would close a cycle
    /// in the wait-for graph; the caller must then abort `trx`.
    pub fn acquire(&self, record: RecordId, trx: TrxId, mode: LockMode) -> Result<()> {
        let mut inner = self.inner.lock();

        // a lock already held by this trx may cover the request
        if let Some(bucket) = inner.buckets.get_mut(&record) {
            if let Some(pos) = bucket
                .iter()
                .position(|e| e.trx_id == trx && e.granted)
            {
                if bucket[pos].mode == LockMode::Exclusive || mode == LockMode::Shared {
                    return Ok(());
                }
                // S → X upgrade in place when no one else holds the record
                if !bucket.iter().any(|e| e.granted && e.trx_id != trx) {
                    bucket[pos].mode = LockMode::Exclusive;
                    return Ok(());
                }
            }
        }

        if grantable(inner.buckets.get(&record).map_or(&[], |b| b.as_slice()), trx, mode) {
            inner.buckets.entry(record).or_default().push(LockEntry {
                trx_id: trx,
                mode,
                granted: true,
            });
            inner.held.entry(trx).or_default().push(record);
            return Ok(());
        }

        // enqueue as a waiter and check for deadlock before parking
        inner.buckets.entry(record).or_default().push(LockEntry {
            trx_id: trx,
            mode,
            granted: false,
        });

        if build_wait_graph(&inner).has_cycle_from(trx) {
            if let Some(bucket) = inner.buckets.get_mut(&record) {
                if let Some(pos) = bucket.iter().position(|e| e.trx_id == trx && !e.granted) {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    inner.buckets.remove(&record);
                }
            }
            debug!("trx {} deadlocked on {:?}", trx, record);
            return Err(StorageError::Deadlock(trx));
        }

        debug!("trx {} waiting for {:?} ({:?})", trx, record, mode);
        loop {
            self.wakeup.wait(&mut inner);
            let granted = inner
                .buckets
                .get(&record)
                .map_or(false, |bucket| {
                    bucket
                        .iter()
                        .any(|e| e.trx_id == trx && e.mode == mode && e.granted)
                });
            if granted {
                inner.held.entry(trx).or_default().push(record);
                return Ok(());
            }
        }
    }

    /// Release every lock `trx` holds (commit or abort), granting and
    /// waking any waiters that become compatible
    pub fn release_all(&self, trx: TrxId) {
        let mut inner = self.inner.lock();
        let mut records = inner.held.remove(&trx).unwrap_or_default();

        // LIFO over the held stack
        while let Some(record) = records.pop() {
            if let Some(bucket) = inner.buckets.get_mut(&record) {
                bucket.retain(|e| e.trx_id != trx);
                grant_waiters(bucket);
                if bucket.is_empty() {
                    inner.buckets.remove(&record);
                }
            }
        }
        drop(inner);
        self.wakeup.notify_all();
    }

    /// Number of granted locks currently held by `trx`
    pub fn held_count(&self, trx: TrxId) -> usize {
        self.inner.lock().held.get(&trx).map_or(0, |v| v.len())
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

fn compatible(requested: LockMode, granted: LockMode) -> bool {
    requested == LockMode::Shared && granted == LockMode::Shared
}

/// Whether a new request by `trx` is compatible with every granted
/// entry of other transactions in the bucket
fn grantable(bucket: &[LockEntry], trx: TrxId, mode: LockMode) -> bool {
    bucket
        .iter()
        .filter(|e| e.granted && e.trx_id != trx)
        .all(|e| compatible(mode, e.mode))
}

/// Walk the bucket in arrival order, granting every waiter that has
/// become compatible with the granted set
fn grant_waiters(bucket: &mut Vec<LockEntry>) {
    for i in 0..bucket.len() {
        if !bucket[i].granted && grantable_at(bucket, i) {
            bucket[i].granted = true;
        }
    }
}

fn grantable_at(bucket: &[LockEntry], at: usize) -> bool {
    let request = &bucket[at];
    bucket
        .iter()
        .enumerate()
        .filter(|&(i, e)| i != at && e.granted && e.trx_id != request.trx_id)
        .all(|(_, e)| compatible(request.mode, e.mode))
}

/// Derive the current wait-for graph: an edge from every waiter to
/// each granted holder it conflicts with
fn build_wait_graph(inner: &LockInner) -> WaitForGraph {
    let mut graph = WaitForGraph::new();
    for bucket in inner.buckets.values() {
        for waiter in bucket.iter().filter(|e| !e.granted) {
            for holder in bucket.iter().filter(|e| e.granted) {
                if !compatible(waiter.mode, holder.mode) {
                    graph.add_edge(waiter.trx_id, holder.trx_id);
                }
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn record(slot: u16) -> RecordId {
        RecordId {
            table_id: 1,
            page_id: PageId::new(2),
            slot,
        }
    }

    #[test]
    fn test_shared_locks_coexist() -> Result<()> {
        let locks = LockManager::new();
        locks.acquire(record(0), 1, LockMode::Shared)?;
        locks.acquire(record(0), 2, LockMode::Shared)?;
        assert_eq!(locks.held_count(1), 1);
        assert_eq!(locks.held_count(2), 1);
        Ok(())
    }

    #[test]
    fn test_reacquire_is_idempotent() -> Result<()> {
        let locks = LockManager::new();
        locks.acquire(record(0), 1, LockMode::Exclusive)?;
        // X covers both a repeated X and a shared request
        locks.acquire(record(0), 1, LockMode::Exclusive)?;
        locks.acquire(record(0), 1, LockMode::Shared)?;
        assert_eq!(locks.held_count(1), 1);
        Ok(())
    }

    #[test]
    fn test_upgrade_when_sole_holder() -> Result<()> {
        let locks = LockManager::new();
        locks.acquire(record(0), 1, LockMode::Shared)?;
        locks.acquire(record(0), 1, LockMode::Exclusive)?;

        // the record is now exclusively held: trx 2 must wait
        let locks = Arc::new(locks);
        let blocked = Arc::new(AtomicBool::new(true));
        let handle = {
            let locks = Arc::clone(&locks);
            let blocked = Arc::clone(&blocked);
            thread::spawn(move || {
                locks.acquire(record(0), 2, LockMode::Shared).unwrap();
                blocked.store(false, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(blocked.load(Ordering::SeqCst));

        locks.release_all(1);
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_exclusive_blocks_until_release() -> Result<()> {
        let locks = Arc::new(LockManager::new());
        locks.acquire(record(0), 1, LockMode::Exclusive)?;

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let locks = Arc::clone(&locks);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                locks.acquire(record(0), 2, LockMode::Exclusive).unwrap();
                acquired.store(true, Ordering::SeqCst);
                locks.release_all(2);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        locks.release_all(1);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_two_trx_cycle_is_deadlock() {
        let locks = Arc::new(LockManager::new());
        locks.acquire(record(5), 1, LockMode::Exclusive).unwrap();
        locks.acquire(record(7), 2, LockMode::Exclusive).unwrap();

        // trx 1 parks waiting for record 7
        let handle = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let result = locks.acquire(record(7), 1, LockMode::Exclusive);
                if result.is_ok() {
                    locks.release_all(1);
                }
                result
            })
        };
        thread::sleep(Duration::from_millis(50));

        // trx 2 closing the cycle must be told to abort
        match locks.acquire(record(5), 2, LockMode::Exclusive) {
            Err(StorageError::Deadlock(2)) => {}
            other => panic!("expected deadlock, got {other:?}"),
        }
        locks.release_all(2);

        // the survivor gets its lock once the victim releases
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_fifo_wakeup_after_release() -> Result<()> {
        let locks = Arc::new(LockManager::new());
        locks.acquire(record(0), 1, LockMode::Exclusive)?;

        let mut handles = Vec::new();
        for trx in [2u32, 3u32] {
            let locks = Arc::clone(&locks);
            handles.push(thread::spawn(move || {
                locks.acquire(record(0), trx, LockMode::Shared).unwrap();
            }));
        }
        thread::sleep(Duration::from_millis(50));

        // both shared waiters are granted together on release
        locks.release_all(1);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.held_count(2), 1);
        assert_eq!(locks.held_count(3), 1);
        Ok(())
    }
}
