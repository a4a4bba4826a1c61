//! Log record variants and their on-disk payload encoding.
//!
//! The file-level framing (`u32 size | payload | u32 size`) lives in
//! [`crate::log::store`]; this module encodes the payload itself:
//! `type_u8 | lsn_u64 | timestamp_u64 | tx_u64 | variant fields`, all
//! big-endian.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::core::errors::{GridError, Result, StorageError};
use crate::log::{Lsn, TxId};
use crate::meta::{Block, PageStore};

const TYPE_START: u8 = 1;
const TYPE_COMMIT: u8 = 2;
const TYPE_ROLLBACK: u8 = 3;
const TYPE_NQCHECK: u8 = 4;
const TYPE_INSERT: u8 = 5;
const TYPE_DELETE: u8 = 6;
const TYPE_READY: u8 = 7;
const TYPE_NOT_READY: u8 = 8;
const TYPE_PREPARE: u8 = 9;
const TYPE_XA_COMMIT: u8 = 10;
const TYPE_XA_ABORT: u8 = 11;

/// Largest accepted payload when decoding; anything bigger is a torn or
/// corrupt frame.
pub const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

/// Record body. `Insert`/`Delete` carry physical (before, after) images; the
/// rest are control records.
#[derive(Debug, Clone, PartialEq)]
pub enum LogData {
    Start {
        tx: TxId,
    },
    Commit {
        tx: TxId,
    },
    Rollback {
        tx: TxId,
    },
    /// Analysis barrier: the set of transactions still active when it was
    /// written. Recovery writes an empty one on completion.
    NQCheck {
        active: Vec<TxId>,
    },
    Insert {
        tx: TxId,
        block: Block,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Delete {
        tx: TxId,
        block: Block,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// This node's durable YES vote, naming the coordinator to consult.
    Ready {
        tx: TxId,
        coordinator: String,
    },
    /// This node's durable NO vote.
    NotReady {
        tx: TxId,
    },
    /// Coordinator's durable participant list, written before phase 1.
    Prepare {
        tx: TxId,
        nodes: Vec<i32>,
    },
    /// Coordinator's durable COMMIT decision.
    XACommit {
        tx: TxId,
        nodes: Vec<i32>,
    },
    /// Coordinator's durable ABORT decision.
    XAAbort {
        tx: TxId,
        nodes: Vec<i32>,
    },
}

/// A record as it lives in the tail and on disk: body plus the LSN and
/// timestamp the log manager stamped at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub timestamp: u64,
    pub body: LogData,
}

impl LogData {
    fn type_tag(&self) -> u8 {
        match self {
            LogData::Start { .. } => TYPE_START,
            LogData::Commit { .. } => TYPE_COMMIT,
            LogData::Rollback { .. } => TYPE_ROLLBACK,
            LogData::NQCheck { .. } => TYPE_NQCHECK,
            LogData::Insert { .. } => TYPE_INSERT,
            LogData::Delete { .. } => TYPE_DELETE,
            LogData::Ready { .. } => TYPE_READY,
            LogData::NotReady { .. } => TYPE_NOT_READY,
            LogData::Prepare { .. } => TYPE_PREPARE,
            LogData::XACommit { .. } => TYPE_XA_COMMIT,
            LogData::XAAbort { .. } => TYPE_XA_ABORT,
        }
    }

    pub fn tx(&self) -> TxId {
        match self {
            LogData::Start { tx }
            | LogData::Commit { tx }
            | LogData::Rollback { tx }
            | LogData::NotReady { tx }
            | LogData::Insert { tx, .. }
            | LogData::Delete { tx, .. }
            | LogData::Ready { tx, .. }
            | LogData::Prepare { tx, .. }
            | LogData::XACommit { tx, .. }
            | LogData::XAAbort { tx, .. } => *tx,
            LogData::NQCheck { .. } => crate::log::TX_NONE,
        }
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn write_block(buf: &mut Vec<u8>, block: &Block) {
    write_bytes(buf, block.path.as_bytes());
    buf.extend_from_slice(&block.num.to_be_bytes());
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()?;
    if len > MAX_RECORD_BYTES {
        return Err(StorageError(format!("implausible field length {len}")).into());
    }
    let mut out = vec![0u8; len as usize];
    cursor.read_exact(&mut out)?;
    Ok(out)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    String::from_utf8(read_bytes(cursor)?)
        .map_err(|e| StorageError(format!("invalid utf8 in log record: {e}")).into())
}

fn read_block(cursor: &mut Cursor<&[u8]>) -> Result<Block> {
    let path = read_string(cursor)?;
    let num = cursor.read_u64::<BigEndian>()?;
    Ok(Block { path, num })
}

impl LogRecord {
    pub fn tx(&self) -> TxId {
        self.body.tx()
    }

    /// Encoded payload length, without the surrounding size frame.
    pub fn size(&self) -> usize {
        self.encode().len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.body.type_tag());
        buf.extend_from_slice(&self.lsn.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.tx().to_be_bytes());
        match &self.body {
            LogData::Start { .. }
            | LogData::Commit { .. }
            | LogData::Rollback { .. }
            | LogData::NotReady { .. } => {}
            LogData::NQCheck { active } => {
                buf.extend_from_slice(&(active.len() as u32).to_be_bytes());
                for tx in active {
                    buf.extend_from_slice(&tx.to_be_bytes());
                }
            }
            LogData::Insert {
                block,
                offset,
                before,
                after,
                ..
            }
            | LogData::Delete {
                block,
                offset,
                before,
                after,
                ..
            } => {
                write_block(&mut buf, block);
                buf.extend_from_slice(&offset.to_be_bytes());
                write_bytes(&mut buf, before);
                write_bytes(&mut buf, after);
            }
            LogData::Ready { coordinator, .. } => {
                write_bytes(&mut buf, coordinator.as_bytes());
            }
            LogData::Prepare { nodes, .. }
            | LogData::XACommit { nodes, .. }
            | LogData::XAAbort { nodes, .. } => {
                buf.extend_from_slice(&(nodes.len() as u32).to_be_bytes());
                for node in nodes {
                    buf.extend_from_slice(&node.to_be_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let tag = cursor.read_u8()?;
        let lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_u64::<BigEndian>()?;
        let tx = cursor.read_u64::<BigEndian>()?;
        let body = match tag {
            TYPE_START => LogData::Start { tx },
            TYPE_COMMIT => LogData::Commit { tx },
            TYPE_ROLLBACK => LogData::Rollback { tx },
            TYPE_NOT_READY => LogData::NotReady { tx },
            TYPE_NQCHECK => {
                let count = cursor.read_u32::<BigEndian>()?;
                let mut active = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    active.push(cursor.read_u64::<BigEndian>()?);
                }
                LogData::NQCheck { active }
            }
            TYPE_INSERT | TYPE_DELETE => {
                let block = read_block(&mut cursor)?;
                let offset = cursor.read_u32::<BigEndian>()?;
                let before = read_bytes(&mut cursor)?;
                let after = read_bytes(&mut cursor)?;
                if tag == TYPE_INSERT {
                    LogData::Insert { tx, block, offset, before, after }
                } else {
                    LogData::Delete { tx, block, offset, before, after }
                }
            }
            TYPE_READY => LogData::Ready {
                tx,
                coordinator: read_string(&mut cursor)?,
            },
            TYPE_PREPARE | TYPE_XA_COMMIT | TYPE_XA_ABORT => {
                let count = cursor.read_u32::<BigEndian>()?;
                let mut nodes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    nodes.push(cursor.read_i32::<BigEndian>()?);
                }
                match tag {
                    TYPE_PREPARE => LogData::Prepare { tx, nodes },
                    TYPE_XA_COMMIT => LogData::XACommit { tx, nodes },
                    _ => LogData::XAAbort { tx, nodes },
                }
            }
            other => {
                return Err(GridError::Storage(StorageError(format!(
                    "unknown log record type {other}"
                ))))
            }
        };
        Ok(LogRecord { lsn, timestamp, body })
    }

    /// Reapply the after-image. Idempotent: applying twice equals once.
    pub fn redo(&self, pages: &dyn PageStore) -> Result<()> {
        match &self.body {
            LogData::Insert { block, offset, after, .. }
            | LogData::Delete { block, offset, after, .. } => pages.apply(block, *offset, after),
            _ => Ok(()),
        }
    }

    /// Restore the before-image.
    pub fn undo(&self, pages: &dyn PageStore) -> Result<()> {
        match &self.body {
            LogData::Insert { block, offset, before, .. }
            | LogData::Delete { block, offset, before, .. } => pages.apply(block, *offset, before),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: LogData) {
        let rec = LogRecord {
            lsn: 1_700_000_000_000_000_123,
            timestamp: 1_700_000_000_000,
            body,
        };
        let decoded = LogRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn control_records_round_trip() {
        round_trip(LogData::Start { tx: 9 });
        round_trip(LogData::Commit { tx: 9 });
        round_trip(LogData::Rollback { tx: 9 });
        round_trip(LogData::NotReady { tx: 9 });
        round_trip(LogData::NQCheck { active: vec![] });
        round_trip(LogData::NQCheck { active: vec![3, 5, 8] });
    }

    #[test]
    fn data_records_round_trip() {
        round_trip(LogData::Insert {
            tx: 42,
            block: Block::new("/dev0/s.t.tbl", 17),
            offset: 256,
            before: vec![0; 16],
            after: vec![1; 16],
        });
        round_trip(LogData::Delete {
            tx: 42,
            block: Block::new("/dev0/s.t.tbl", 17),
            offset: 0,
            before: b"live".to_vec(),
            after: vec![],
        });
    }

    #[test]
    fn xa_records_round_trip() {
        round_trip(LogData::Ready { tx: 7, coordinator: "coord0".into() });
        round_trip(LogData::Prepare { tx: 7, nodes: vec![1, 2, 3] });
        round_trip(LogData::XACommit { tx: 7, nodes: vec![1, 2, 3] });
        round_trip(LogData::XAAbort { tx: 7, nodes: vec![] });
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let rec = LogRecord {
            lsn: 10,
            timestamp: 20,
            body: LogData::Ready { tx: 1, coordinator: "h".into() },
        };
        let bytes = rec.encode();
        assert!(LogRecord::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn redo_is_idempotent() {
        use crate::meta::memory::MemPageStore;

        let pages = MemPageStore::new(0);
        let rec = LogRecord {
            lsn: 5,
            timestamp: 5,
            body: LogData::Insert {
                tx: 1,
                block: Block::new("/t.tbl", 1),
                offset: 64,
                before: vec![0; 8],
                after: vec![7; 8],
            },
        };
        rec.redo(&pages).unwrap();
        let once = pages.snapshot(&Block::new("/t.tbl", 1)).unwrap();
        rec.redo(&pages).unwrap();
        let twice = pages.snapshot(&Block::new("/t.tbl", 1)).unwrap();
        assert_eq!(once, twice);

        rec.undo(&pages).unwrap();
        let undone = pages.snapshot(&Block::new("/t.tbl", 1)).unwrap();
        assert_eq!(&undone[64..72], &[0u8; 8]);
    }
}
