//! Cluster data model and the contracts the transactional core requires of
//! its collaborators (buffer pool, page layout, secondary indexes, catalog).
//!
//! The core never looks inside a page or an index; it drives them through
//! these traits and logs the byte images they report.

pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::log::Lsn;

/// Number of header blocks at the front of every table file. Block numbers
/// below this are metadata and never hold rows.
pub const HEADER_BLOCKS: u64 = 1;

/// Identifies a fixed-size page on a device: (file path, block number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub path: String,
    pub num: u64,
}

impl Block {
    pub fn new<P: Into<String>>(path: P, num: u64) -> Self {
        Self { path: path.into(), num }
    }
}

/// Globally unique record id: (node, device, block, slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub node: i32,
    pub device: i32,
    pub block: u64,
    pub slot: u32,
}

impl Rid {
    pub fn new(node: i32, device: i32, block: u64, slot: u32) -> Self {
        Self { node, device, block, slot }
    }
}

/// Column value kinds understood by the core. Index keys and wire payloads
/// are vectors of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColValue {
    Int(i32),
    Bigint(i64),
    Double(f64),
    Varchar(String),
    /// Days since the epoch.
    Date(i32),
}

impl ColValue {
    /// Stable hash used for partitioning rows across devices. `f64` hashes
    /// by bit pattern.
    pub fn hash_code(&self) -> u64 {
        const PRIME: u64 = 0x100_0000_01b3;
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |b: u64| {
            h ^= b;
            h = h.wrapping_mul(PRIME);
        };
        match self {
            ColValue::Int(v) => mix(*v as u64),
            ColValue::Bigint(v) => mix(*v as u64),
            ColValue::Double(v) => mix(v.to_bits()),
            ColValue::Varchar(s) => {
                for byte in s.as_bytes() {
                    mix(*byte as u64);
                }
            }
            ColValue::Date(v) => mix(*v as u64),
        }
        h
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Bigint,
    Double,
    Varchar,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColDef {
    pub name: String,
    pub ctype: ColType,
}

/// Table identity plus column layout, as shipped by the coordinator with
/// every DML batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub cols: Vec<ColDef>,
}

impl TableSchema {
    pub fn col_pos(&self, name: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.name == name)
    }

    /// Table file name under a device root: `<schema>.<table>.tbl`.
    pub fn file_name(&self) -> String {
        format!("{}.{}.tbl", self.schema, self.table)
    }
}

/// Secondary-index definition: file name, key columns, their types, and
/// per-column sort direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub key_cols: Vec<String>,
    pub types: Vec<ColType>,
    pub ascending: Vec<bool>,
}

impl IndexDef {
    /// Extract this index's key values from a full row.
    pub fn key_of(&self, row: &[ColValue], schema: &TableSchema) -> Vec<ColValue> {
        self.key_cols
            .iter()
            .filter_map(|c| schema.col_pos(c))
            .map(|p| row[p].clone())
            .collect()
    }

    /// True when any of the updated column positions participates in the key.
    pub fn overlaps(&self, updated: &[usize], schema: &TableSchema) -> bool {
        self.key_cols
            .iter()
            .filter_map(|c| schema.col_pos(c))
            .any(|p| updated.contains(&p))
    }
}

/// Partitioning metadata: which columns feed the device hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub cols: Vec<usize>,
}

/// Byte image of one slot mutation, exactly as the redo/undo log carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub block: Block,
    pub offset: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// Result of a row insert: the assigned RID plus its byte image.
#[derive(Debug, Clone)]
pub struct RowInsert {
    pub rid: Rid,
    pub image: RowImage,
}

/// Result of a row update. The page layout may relocate an expanded row, in
/// which case `new_rid != old_rid`; either way the change decomposes into a
/// delete image and an insert image for the log.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub old_rid: Rid,
    pub new_rid: Rid,
    pub delete: RowImage,
    pub insert: RowImage,
}

/// RID relocation report returned to DML callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RidChange {
    pub old: Rid,
    pub new: Rid,
}

/// Buffer-pool contract.
///
/// Implementations must observe the WAL rule: before a dirty page reaches
/// disk, every log record up to that page's LSN must be durable. The
/// `flush_gate` hook is how they satisfy it.
pub trait PageStore: Send + Sync {
    /// Prefetch hint for a single page.
    fn request_page(&self, block: &Block) -> Result<()>;
    /// Prefetch hint for a batch of pages.
    fn request_pages(&self, blocks: &[Block]) -> Result<()>;
    /// Pin a page for row operations under the given schema.
    fn page(&self, block: &Block, schema: &TableSchema) -> Result<Arc<dyn RowPage>>;
    /// Physical write of `bytes` at `offset` within the page, creating the
    /// page if absent. This is the redo/undo entry point.
    fn apply(&self, block: &Block, offset: u32, bytes: &[u8]) -> Result<()>;
    /// WAL gate: blocks until every log record with LSN `<= lsn` is
    /// durable. The pool must call this before a dirty page stamped with
    /// `lsn` leaves memory; returning an error means the page must not be
    /// written.
    fn flush_gate(&self, lsn: Lsn) -> Result<()>;
    /// Number of blocks currently in a table file.
    fn block_count(&self, table_path: &str) -> Result<u64>;
}

/// Data-page record layout contract. Row operations report the byte images
/// the core must log; they never touch the log themselves.
pub trait RowPage: Send + Sync {
    fn insert_row(&self, values: &[ColValue]) -> Result<RowInsert>;
    fn delete_row(&self, rid: &Rid) -> Result<RowImage>;
    fn update_row(&self, rid: &Rid, cols: &[usize], values: &[ColValue]) -> Result<RowUpdate>;
    /// RIDs of live rows on this page, in slot order.
    fn live_rids(&self) -> Result<Vec<Rid>>;
}

/// Secondary-index contract.
pub trait SecondaryIndex: Send {
    fn insert(&mut self, key: &[ColValue], rid: Rid) -> Result<()>;
    fn delete(&mut self, key: &[ColValue], rid: Rid) -> Result<()>;
    /// Re-point an entry whose key is unchanged but whose RID moved.
    fn update(&mut self, key: &[ColValue], old: Rid, new: Rid) -> Result<()>;
    fn mass_delete(&mut self) -> Result<()>;
}

/// Opens index instances by file path and definition.
pub trait IndexFactory: Send + Sync {
    fn open(&self, path: &str, def: &IndexDef) -> Result<Box<dyn SecondaryIndex>>;
}

/// Result-stream transport contract (`REMOTTRE` / `SNDRMTTR`). Opaque to
/// the transactional core; the embedder's query engine installs one.
pub trait ResultStreamer: Send + Sync {
    fn handle(&self, command: [u8; 8], stream: &mut std::net::TcpStream) -> Result<()>;
}

/// Cluster metadata contract.
pub trait Catalog: Send + Sync {
    fn host_for_node(&self, node: i32) -> Result<String>;
    fn device_path(&self, device: i32) -> Result<String>;
    fn device_count(&self) -> usize;
    /// Target device for an inserted row under the table's partitioning.
    fn determine_device(&self, row: &[ColValue], part: &PartitionMeta) -> i32;
}

/// Full path of a table file on one device.
pub fn table_file(device_path: &str, schema: &TableSchema) -> String {
    format!("{}/{}", device_path.trim_end_matches('/'), schema.file_name())
}

/// Full path of an index file on one device.
pub fn index_file(device_path: &str, index_name: &str) -> String {
    format!("{}/{}", device_path.trim_end_matches('/'), index_name)
}
