//! Append-only log manager.
//!
//! Records are appended to an in-memory tail buffer and assigned LSNs
//! equal to their byte offset in the log file. `flush_to` makes the
//! tail durable; the buffer pool calls it before writing out any page
//! whose `page_lsn` is not yet on disk, and commit calls it before
//! reporting success.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::types::{Lsn, TrxId};

use super::record::{LogRecord, RecordBody};

struct LogInner {
    file: File,
    /// Length of the durable prefix of the log; every LSN below this
    /// is on disk
    durable_len: u64,
    /// Encoded records not yet written to the file
    tail: Vec<u8>,
}

/// Process-wide append-only log
pub struct LogManager {
    inner: Mutex<LogInner>,
}

impl LogManager {
    /// Open (or create) the log file, validating the existing records
    /// and truncating anything after the last intact one
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let valid_len = validate_log(&file)?;
        if valid_len < file.metadata()?.len() {
            warn!(
                "log {:?} has a torn tail, truncating to {} bytes",
                path, valid_len
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                durable_len: valid_len,
                tail: Vec::new(),
            }),
        })
    }

    /// Append a record to the log tail, returning its LSN
    pub fn append(&self, prev_lsn: Lsn, trx_id: TrxId, body: RecordBody) -> Lsn {
        let mut inner = self.inner.lock();
        let lsn = inner.durable_len + inner.tail.len() as u64;
        let record = LogRecord {
            lsn,
            prev_lsn,
            trx_id,
            body,
        };
        let encoded = record.encode();
        inner.tail.extend(encoded);
        lsn
    }

    /// Highest LSN strictly below which every record is durable
    pub fn flushed_lsn(&self) -> Lsn {
        self.inner.lock().durable_len
    }

    /// LSN the next appended record will receive
    pub fn next_lsn(&self) -> Lsn {
        let inner = self.inner.lock();
        inner.durable_len + inner.tail.len() as u64
    }

    /// Make the log durable through `lsn`
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if lsn < inner.durable_len {
            return Ok(());
        }
        self.flush_tail(&mut inner)
    }

    /// Make the whole tail durable
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_tail(&mut inner)
    }

    fn flush_tail(&self, inner: &mut LogInner) -> Result<()> {
        if inner.tail.is_empty() {
            return Ok(());
        }
        let at = inner.durable_len;
        inner.file.write_all_at(&inner.tail, at)?;
        inner.file.sync_data()?;
        inner.durable_len += inner.tail.len() as u64;
        inner.tail.clear();
        debug!("log flushed through {}", inner.durable_len);
        Ok(())
    }

    /// Read the record starting at `lsn`, whether durable or still in
    /// the tail
    pub fn record_at(&self, lsn: Lsn) -> Result<LogRecord> {
        let inner = self.inner.lock();

        let (record, _) = if lsn >= inner.durable_len {
            let at = (lsn - inner.durable_len) as usize;
            if at >= inner.tail.len() {
                return Err(StorageError::corrupt(format!("no log record at {lsn}")));
            }
            LogRecord::decode(&inner.tail[at..])
                .ok_or_else(|| StorageError::corrupt(format!("bad log record at {lsn}")))?
        } else {
            let mut prefix = [0u8; 8];
            inner.file.read_exact_at(&mut prefix, lsn)?;
            let len = u32::from_be_bytes(prefix[0..4].try_into().unwrap()) as usize;
            let mut buf = vec![0u8; 8 + len];
            inner.file.read_exact_at(&mut buf, lsn)?;
            LogRecord::decode(&buf)
                .ok_or_else(|| StorageError::corrupt(format!("bad log record at {lsn}")))?
        };

        if record.lsn != lsn {
            return Err(StorageError::corrupt(format!(
                "log record at {lsn} claims lsn {}",
                record.lsn
            )));
        }
        Ok(record)
    }

    /// Read every durable record from the start of the log in order
    pub fn scan(&self) -> Result<Vec<LogRecord>> {
        let inner = self.inner.lock();
        let mut buf = vec![0u8; inner.durable_len as usize];
        inner.file.read_exact_at(&mut buf, 0)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            let (record, consumed) = LogRecord::decode(&buf[offset..])
                .ok_or_else(|| StorageError::corrupt(format!("bad log record at {offset}")))?;
            if record.lsn != offset as u64 {
                return Err(StorageError::corrupt(format!(
                    "log record at {offset} claims lsn {}",
                    record.lsn
                )));
            }
            records.push(record);
            offset += consumed;
        }
        Ok(records)
    }
}

/// Scan the log from the start, returning the length of its valid
/// prefix (records decode cleanly and sit at their claimed LSN)
fn validate_log(file: &File) -> Result<u64> {
    let len = file.metadata()?.len();
    let mut buf = vec![0u8; len as usize];
    file.read_exact_at(&mut buf, 0)?;

    let mut offset = 0usize;
    while offset < buf.len() {
        match LogRecord::decode(&buf[offset..]) {
            Some((record, consumed)) if record.lsn == offset as u64 => offset += consumed,
            _ => break,
        }
    }
    Ok(offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageId;
    use crate::wal::record::PageUpdate;
    use tempfile::tempdir;

    fn update_body() -> RecordBody {
        RecordBody::Update(PageUpdate {
            table_id: 1,
            page_id: PageId::new(2),
            offset: 300,
            size: 3,
            before: b"old".to_vec(),
            after: b"new".to_vec(),
        })
    }

    #[test]
    fn test_lsn_is_byte_offset() -> Result<()> {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(dir.path().join("wal"))?;

        let a = wal.append(0, 1, RecordBody::Begin);
        let b = wal.append(a, 1, update_body());
        let c = wal.append(b, 1, RecordBody::Commit);
        assert_eq!(a, 0);
        assert!(b > a && c > b);

        wal.flush_to(c)?;
        assert_eq!(wal.flushed_lsn(), wal.next_lsn());

        let records = wal.scan()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, a);
        assert_eq!(records[1].lsn, b);
        assert_eq!(records[1].prev_lsn, a);
        assert_eq!(records[2].lsn, c);
        Ok(())
    }

    #[test]
    fn test_record_at_reads_tail_and_disk() -> Result<()> {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(dir.path().join("wal"))?;

        let a = wal.append(0, 1, RecordBody::Begin);
        wal.flush_all()?;
        let b = wal.append(a, 1, update_body());

        // a is durable, b still sits in the tail
        assert!(wal.flushed_lsn() <= b);
        assert_eq!(wal.record_at(a)?.body, RecordBody::Begin);
        assert_eq!(wal.record_at(b)?.body, update_body());
        Ok(())
    }

    #[test]
    fn test_unflushed_tail_lost_on_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = LogManager::open(&path)?;
            let a = wal.append(0, 1, RecordBody::Begin);
            wal.flush_to(a)?;
            wal.append(a, 1, RecordBody::Commit); // never flushed
        }

        let wal = LogManager::open(&path)?;
        let records = wal.scan()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, RecordBody::Begin);
        Ok(())
    }

    #[test]
    fn test_torn_tail_truncated_on_open() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        let end = {
            let wal = LogManager::open(&path)?;
            wal.append(0, 1, RecordBody::Begin);
            let end = wal.append(0, 2, RecordBody::Begin);
            wal.flush_all()?;
            end
        };

        // cut the second record in half, as a crashed flush would
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(end + 3)?;

        let wal = LogManager::open(&path)?;
        let records = wal.scan()?;
        assert_eq!(records.len(), 1);
        assert_eq!(wal.next_lsn(), end);
        Ok(())
    }
}
