//! Log record encoding and decoding.
//!
//! Records are self-delimiting and CRC-protected:
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Length of everything after this field
//! 4       4     CRC32 of everything after this field
//! 8       8     LSN (byte offset of this record in the log)
//! 16      8     prev_LSN (previous record of the same transaction)
//! 24      4     Transaction id
//! 28      1     Record kind
//! 29      -     Body (UPDATE/CLR only)
//! ```
//!
//! UPDATE body: `table_id(8) page_id(8) offset(2) size(2)
//! before[size] after[size]`. CLR body: UPDATE body followed by
//! `next_undo_lsn(8)`.

use crate::types::{Lsn, PageId, TableId, TrxId};

const KIND_BEGIN: u8 = 0;
const KIND_UPDATE: u8 = 1;
const KIND_COMMIT: u8 = 2;
const KIND_ROLLBACK: u8 = 3;
const KIND_CLR: u8 = 4;

/// Fixed bytes before the body: lsn + prev_lsn + trx_id + kind
const FIXED_LEN: usize = 8 + 8 + 4 + 1;

/// Byte range of one page changed by a transaction, with both images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUpdate {
    pub table_id: TableId,
    pub page_id: PageId,
    pub offset: u16,
    pub size: u16,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// Payload of a log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Begin,
    Update(PageUpdate),
    Commit,
    Rollback,
    /// Compensation record written while undoing an UPDATE;
    /// `next_undo_lsn` points at the next record to undo
    Clr {
        update: PageUpdate,
        next_undo_lsn: Lsn,
    },
}

/// One record of the write-ahead log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub trx_id: TrxId,
    pub body: RecordBody,
}

impl LogRecord {
    /// Encode this record, including its length prefix and checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FIXED_LEN + 32);
        payload.extend(self.lsn.to_be_bytes());
        payload.extend(self.prev_lsn.to_be_bytes());
        payload.extend(self.trx_id.to_be_bytes());

        match &self.body {
            RecordBody::Begin => payload.push(KIND_BEGIN),
            RecordBody::Commit => payload.push(KIND_COMMIT),
            RecordBody::Rollback => payload.push(KIND_ROLLBACK),
            RecordBody::Update(update) => {
                payload.push(KIND_UPDATE);
                encode_update(&mut payload, update);
            }
            RecordBody::Clr {
                update,
                next_undo_lsn,
            } => {
                payload.push(KIND_CLR);
                encode_update(&mut payload, update);
                payload.extend(next_undo_lsn.to_be_bytes());
            }
        }

        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend((payload.len() as u32).to_be_bytes());
        buf.extend(crc32fast::hash(&payload).to_be_bytes());
        buf.extend(payload);
        buf
    }

    /// Decode one record from the front of `bytes`.
    ///
    /// Returns the record and the total bytes consumed, or `None` if
    /// the bytes are truncated, checksum-damaged, or malformed.
    pub fn decode(bytes: &[u8]) -> Option<(LogRecord, usize)> {
        if bytes.len() < 8 {
            return None;
        }
        let len = u32::from_be_bytes(bytes[0..4].try_into().ok()?) as usize;
        let crc = u32::from_be_bytes(bytes[4..8].try_into().ok()?);
        if len < FIXED_LEN || bytes.len() < 8 + len {
            return None;
        }
        let payload = &bytes[8..8 + len];
        if crc32fast::hash(payload) != crc {
            return None;
        }

        let lsn = u64::from_be_bytes(payload[0..8].try_into().ok()?);
        let prev_lsn = u64::from_be_bytes(payload[8..16].try_into().ok()?);
        let trx_id = u32::from_be_bytes(payload[16..20].try_into().ok()?);
        let kind = payload[20];
        let body_bytes = &payload[FIXED_LEN..];

        let body = match kind {
            KIND_BEGIN => RecordBody::Begin,
            KIND_COMMIT => RecordBody::Commit,
            KIND_ROLLBACK => RecordBody::Rollback,
            KIND_UPDATE => {
                let (update, consumed) = decode_update(body_bytes)?;
                if consumed != body_bytes.len() {
                    return None;
                }
                RecordBody::Update(update)
            }
            KIND_CLR => {
                let (update, consumed) = decode_update(body_bytes)?;
                let rest = &body_bytes[consumed..];
                if rest.len() != 8 {
                    return None;
                }
                let next_undo_lsn = u64::from_be_bytes(rest.try_into().ok()?);
                RecordBody::Clr {
                    update,
                    next_undo_lsn,
                }
            }
            _ => return None,
        };

        Some((
            LogRecord {
                lsn,
                prev_lsn,
                trx_id,
                body,
            },
            8 + len,
        ))
    }

    /// The page update carried by an UPDATE or CLR record
    pub fn page_update(&self) -> Option<&PageUpdate> {
        match &self.body {
            RecordBody::Update(update) => Some(update),
            RecordBody::Clr { update, .. } => Some(update),
            _ => None,
        }
    }

    /// Short human-readable tag for traces
    pub fn kind_name(&self) -> &'static str {
        match self.body {
            RecordBody::Begin => "BEGIN",
            RecordBody::Update(_) => "UPDATE",
            RecordBody::Commit => "COMMIT",
            RecordBody::Rollback => "ROLLBACK",
            RecordBody::Clr { .. } => "CLR",
        }
    }
}

fn encode_update(buf: &mut Vec<u8>, update: &PageUpdate) {
    debug_assert_eq!(update.before.len(), update.size as usize);
    debug_assert_eq!(update.after.len(), update.size as usize);
    buf.extend(update.table_id.to_be_bytes());
    buf.extend(update.page_id.value().to_be_bytes());
    buf.extend(update.offset.to_be_bytes());
    buf.extend(update.size.to_be_bytes());
    buf.extend(&update.before);
    buf.extend(&update.after);
}

fn decode_update(bytes: &[u8]) -> Option<(PageUpdate, usize)> {
    if bytes.len() < 20 {
        return None;
    }
    let table_id = i64::from_be_bytes(bytes[0..8].try_into().ok()?);
    let page_id = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
    let offset = u16::from_be_bytes(bytes[16..18].try_into().ok()?);
    let size = u16::from_be_bytes(bytes[18..20].try_into().ok()?) as usize;
    if bytes.len() < 20 + 2 * size {
        return None;
    }
    let before = bytes[20..20 + size].to_vec();
    let after = bytes[20 + size..20 + 2 * size].to_vec();
    Some((
        PageUpdate {
            table_id,
            page_id: PageId::new(page_id),
            offset,
            size: size as u16,
            before,
            after,
        },
        20 + 2 * size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_record_roundtrip() {
        let record = LogRecord {
            lsn: 4096,
            prev_lsn: 128,
            trx_id: 7,
            body: RecordBody::Update(PageUpdate {
                table_id: 2,
                page_id: PageId::new(19),
                offset: 3900,
                size: 4,
                before: b"aaaa".to_vec(),
                after: b"bbbb".to_vec(),
            }),
        };

        let encoded = record.encode();
        let (decoded, consumed) = LogRecord::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_clr_carries_next_undo() {
        let record = LogRecord {
            lsn: 99,
            prev_lsn: 50,
            trx_id: 3,
            body: RecordBody::Clr {
                update: PageUpdate {
                    table_id: 1,
                    page_id: PageId::new(5),
                    offset: 0,
                    size: 2,
                    before: vec![1, 2],
                    after: vec![3, 4],
                },
                next_undo_lsn: 17,
            },
        };

        let (decoded, _) = LogRecord::decode(&record.encode()).unwrap();
        match decoded.body {
            RecordBody::Clr { next_undo_lsn, .. } => assert_eq!(next_undo_lsn, 17),
            other => panic!("expected CLR, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_record_rejected() {
        let record = LogRecord {
            lsn: 0,
            prev_lsn: 0,
            trx_id: 1,
            body: RecordBody::Begin,
        };
        let mut encoded = record.encode();

        // damage the payload; the CRC must catch it
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(LogRecord::decode(&encoded).is_none());

        // truncation is also rejected
        let encoded = record.encode();
        assert!(LogRecord::decode(&encoded[..encoded.len() - 1]).is_none());
    }
}
