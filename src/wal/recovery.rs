//! ARIES-style restart recovery.
//!
//! Three passes over the log: **analysis** rebuilds the table of
//! transactions that were active at the crash, **redo** repeats
//! history for every page whose `page_lsn` predates a logged change,
//! and **undo** rolls the losers back with compensation records, ending
//! each with ROLLBACK. A human-readable trace of every pass is
//! appended to the trace file given at startup.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use log::info;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::trx::{rollback_chain, TrxManager};
use crate::types::{Lsn, TrxId};
use crate::wal::{LogManager, RecordBody};

/// How far recovery runs before handing the engine back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Analysis, redo and undo (normal operation)
    Full,
    /// Stop after analysis + redo (diagnostic)
    RedoOnly,
    /// Stop after replaying this many UPDATE/CLR records (diagnostic)
    RedoLimit(usize),
}

impl RecoveryMode {
    /// Decode the numeric flag of the startup interface
    pub fn from_flag(flag: i32, log_num: usize) -> Self {
        match flag {
            1 => RecoveryMode::RedoOnly,
            2 => RecoveryMode::RedoLimit(log_num),
            _ => RecoveryMode::Full,
        }
    }
}

/// Run restart recovery over the durable log
pub fn run(
    wal: &LogManager,
    pool: &BufferPool,
    trxs: &TrxManager,
    mode: RecoveryMode,
    trace_path: &Path,
) -> Result<()> {
    let mut trace = OpenOptions::new()
        .create(true)
        .append(true)
        .open(trace_path)?;
    let records = wal.scan()?;

    // --- analysis ---
    writeln!(trace, "[ANALYSIS] pass start")?;
    let mut active: BTreeMap<TrxId, Lsn> = BTreeMap::new();
    let mut finished: Vec<TrxId> = Vec::new();
    let mut max_trx: TrxId = 0;
    for record in &records {
        max_trx = max_trx.max(record.trx_id);
        match record.body {
            RecordBody::Begin => {
                active.insert(record.trx_id, record.lsn);
            }
            RecordBody::Commit | RecordBody::Rollback => {
                active.remove(&record.trx_id);
                finished.push(record.trx_id);
            }
            _ => {
                active.insert(record.trx_id, record.lsn);
            }
        }
    }
    trxs.reseed(max_trx + 1);
    writeln!(
        trace,
        "[ANALYSIS] pass end, finished: {:?}, losers: {:?}",
        finished,
        active.keys().collect::<Vec<_>>()
    )?;
    info!(
        "recovery analysis: {} records, {} losers",
        records.len(),
        active.len()
    );

    // --- redo ---
    writeln!(trace, "[REDO] pass start")?;
    let mut replayed = 0usize;
    for record in &records {
        let update = match record.page_update() {
            Some(update) => update,
            None => continue,
        };
        let guard = pool.fetch_page_mut(update.table_id, update.page_id)?;
        let mut page = guard.write();
        if page.page_lsn() < record.lsn {
            page.write_range(update.offset as usize, &update.after);
            page.set_page_lsn(record.lsn);
            writeln!(
                trace,
                "[REDO] lsn {} {} trx {} page {}:{} applied",
                record.lsn,
                record.kind_name(),
                record.trx_id,
                update.table_id,
                update.page_id
            )?;
        } else {
            writeln!(
                trace,
                "[REDO] lsn {} {} trx {} page {}:{} already on page",
                record.lsn,
                record.kind_name(),
                record.trx_id,
                update.table_id,
                update.page_id
            )?;
        }
        drop(page);
        drop(guard);

        replayed += 1;
        if let RecoveryMode::RedoLimit(limit) = mode {
            if replayed >= limit {
                writeln!(trace, "[REDO] stopped after {} records", replayed)?;
                return Ok(());
            }
        }
    }
    writeln!(trace, "[REDO] pass end, {} records considered", replayed)?;

    if mode == RecoveryMode::RedoOnly {
        writeln!(trace, "[RECOVERY] stopped before undo")?;
        return Ok(());
    }

    // --- undo ---
    writeln!(trace, "[UNDO] pass start")?;
    for (&trx, &last_lsn) in &active {
        let chained = rollback_chain(wal, pool, trx, last_lsn, false)?;
        let rollback_lsn = wal.append(chained, trx, RecordBody::Rollback);
        writeln!(
            trace,
            "[UNDO] trx {} rolled back, ROLLBACK at lsn {}",
            trx, rollback_lsn
        )?;
    }
    wal.flush_all()?;
    writeln!(trace, "[UNDO] pass end")?;
    writeln!(trace, "[RECOVERY] complete")?;
    info!("recovery complete, {} losers undone", active.len());
    Ok(())
}
