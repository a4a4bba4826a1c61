//! In-memory reference collaborators.
//!
//! These back the standalone server binary and the test suites. Pages are
//! fixed-size buffers of fixed-width slots so that redo/undo byte images
//! replay deterministically; none of this is a real buffer pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;

use crate::core::errors::{GridError, Result};
use crate::log::Lsn;
use crate::meta::{
    Block, Catalog, ColValue, IndexDef, IndexFactory, PageStore, PartitionMeta, Rid, RowImage,
    RowInsert, RowPage, RowUpdate, SecondaryIndex, TableSchema, HEADER_BLOCKS,
};

pub const PAGE_SIZE: usize = 4096;
pub const SLOT_BYTES: usize = 128;
pub const SLOTS_PER_PAGE: usize = PAGE_SIZE / SLOT_BYTES;

const SLOT_LIVE: u8 = 1;
const SLOT_HEADER: usize = 5; // live flag + payload length

struct TableData {
    device: i32,
    blocks: Mutex<Vec<Vec<u8>>>,
}

type WalGate = Box<dyn Fn(Lsn) -> Result<()> + Send + Sync>;

/// In-memory page store keyed by table file path. Device ids are resolved by
/// longest-prefix match against registered device roots.
pub struct MemPageStore {
    node: i32,
    devices: Mutex<Vec<(String, i32)>>,
    tables: Mutex<HashMap<String, Arc<TableData>>>,
    wal_gate: Mutex<Option<WalGate>>,
}

impl MemPageStore {
    pub fn new(node: i32) -> Self {
        Self {
            node,
            devices: Mutex::new(Vec::new()),
            tables: Mutex::new(HashMap::new()),
            wal_gate: Mutex::new(None),
        }
    }

    pub fn add_device<P: Into<String>>(&self, prefix: P, device: i32) {
        self.devices.lock().push((prefix.into(), device));
    }

    /// Install the write-ahead-log hook the gate delegates to, normally the
    /// log manager's `flush` on the node's active log.
    pub fn set_wal_gate<F>(&self, gate: F)
    where
        F: Fn(Lsn) -> Result<()> + Send + Sync + 'static,
    {
        *self.wal_gate.lock() = Some(Box::new(gate));
    }

    fn device_of(&self, path: &str) -> i32 {
        let devices = self.devices.lock();
        devices
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, id)| *id)
            .unwrap_or(0)
    }

    fn table(&self, path: &str) -> Arc<TableData> {
        let mut tables = self.tables.lock();
        tables
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(TableData {
                    device: self.device_of(path),
                    blocks: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Raw page bytes, for test assertions on byte-identical recovery.
    pub fn snapshot(&self, block: &Block) -> Option<Vec<u8>> {
        let tables = self.tables.lock();
        let table = tables.get(&block.path)?;
        let result = table.blocks.lock().get(block.num as usize).cloned();
        result
    }
}

fn ensure_block(blocks: &mut Vec<Vec<u8>>, num: u64) {
    while blocks.len() <= num as usize {
        blocks.push(vec![0u8; PAGE_SIZE]);
    }
}

fn encode_slot(values: &[ColValue]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(values)?;
    if payload.len() > SLOT_BYTES - SLOT_HEADER {
        return Err(GridError::App(format!(
            "row of {} bytes exceeds slot capacity",
            payload.len()
        )));
    }
    let mut slot = vec![0u8; SLOT_BYTES];
    slot[0] = SLOT_LIVE;
    BigEndian::write_u32(&mut slot[1..5], payload.len() as u32);
    slot[SLOT_HEADER..SLOT_HEADER + payload.len()].copy_from_slice(&payload);
    Ok(slot)
}

fn decode_slot(slot: &[u8]) -> Result<Vec<ColValue>> {
    let len = BigEndian::read_u32(&slot[1..5]) as usize;
    Ok(bincode::deserialize(&slot[SLOT_HEADER..SLOT_HEADER + len])?)
}

impl PageStore for MemPageStore {
    fn request_page(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn request_pages(&self, _blocks: &[Block]) -> Result<()> {
        Ok(())
    }

    fn page(&self, block: &Block, _schema: &TableSchema) -> Result<Arc<dyn RowPage>> {
        let table = self.table(&block.path);
        Ok(Arc::new(MemPage {
            node: self.node,
            device: table.device,
            path: block.path.clone(),
            block: block.num,
            table,
        }))
    }

    fn apply(&self, block: &Block, offset: u32, bytes: &[u8]) -> Result<()> {
        let table = self.table(&block.path);
        let mut blocks = table.blocks.lock();
        ensure_block(&mut blocks, block.num);
        let page = &mut blocks[block.num as usize];
        let start = offset as usize;
        if start + bytes.len() > page.len() {
            return Err(GridError::Storage(crate::core::errors::StorageError(format!(
                "write of {} bytes at offset {start} exceeds page size",
                bytes.len()
            ))));
        }
        page[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush_gate(&self, lsn: Lsn) -> Result<()> {
        // pages here never reach disk, but a node that owns a log still
        // honors the rule: nothing stamped past the durable LSN may leave
        // memory without the log catching up first
        match &*self.wal_gate.lock() {
            Some(gate) => gate(lsn),
            None => Ok(()),
        }
    }

    fn block_count(&self, table_path: &str) -> Result<u64> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table_path)
            .map(|t| t.blocks.lock().len() as u64)
            .unwrap_or(0))
    }
}

struct MemPage {
    node: i32,
    device: i32,
    path: String,
    block: u64,
    table: Arc<TableData>,
}

impl MemPage {
    fn slot_range(slot: u32) -> (usize, usize) {
        let start = slot as usize * SLOT_BYTES;
        (start, start + SLOT_BYTES)
    }
}

impl RowPage for MemPage {
    fn insert_row(&self, values: &[ColValue]) -> Result<RowInsert> {
        let after = encode_slot(values)?;
        let mut blocks = self.table.blocks.lock();
        ensure_block(&mut blocks, self.block.max(HEADER_BLOCKS));
        let mut target = None;
        let mut num = self.block.max(HEADER_BLOCKS);
        while target.is_none() {
            if num as usize >= blocks.len() {
                ensure_block(&mut blocks, num);
            }
            let page = &blocks[num as usize];
            for slot in 0..SLOTS_PER_PAGE as u32 {
                let (start, _) = Self::slot_range(slot);
                if page[start] != SLOT_LIVE {
                    target = Some((num, slot));
                    break;
                }
            }
            if target.is_none() {
                num += 1;
            }
        }
        let (num, slot) = target.expect("slot search always terminates");
        let (start, end) = Self::slot_range(slot);
        let page = &mut blocks[num as usize];
        let before = page[start..end].to_vec();
        page[start..end].copy_from_slice(&after);
        Ok(RowInsert {
            rid: Rid::new(self.node, self.device, num, slot),
            image: RowImage {
                block: Block::new(self.path.clone(), num),
                offset: start as u32,
                before,
                after,
            },
        })
    }

    fn delete_row(&self, rid: &Rid) -> Result<RowImage> {
        let mut blocks = self.table.blocks.lock();
        ensure_block(&mut blocks, rid.block);
        let (start, end) = Self::slot_range(rid.slot);
        let page = &mut blocks[rid.block as usize];
        let before = page[start..end].to_vec();
        let after = vec![0u8; SLOT_BYTES];
        page[start..end].copy_from_slice(&after);
        Ok(RowImage {
            block: Block::new(self.path.clone(), rid.block),
            offset: start as u32,
            before,
            after,
        })
    }

    fn update_row(&self, rid: &Rid, cols: &[usize], values: &[ColValue]) -> Result<RowUpdate> {
        let current = {
            let blocks = self.table.blocks.lock();
            let page = blocks
                .get(rid.block as usize)
                .ok_or_else(|| GridError::App(format!("no such block {}", rid.block)))?;
            let (start, end) = Self::slot_range(rid.slot);
            if page[start] != SLOT_LIVE {
                return Err(GridError::App(format!("no live row at {rid:?}")));
            }
            decode_slot(&page[start..end])?
        };
        let mut next = current;
        for (pos, value) in cols.iter().zip(values) {
            if *pos < next.len() {
                next[*pos] = value.clone();
            }
        }
        // Fixed-width slots always refit, so the update stays in place:
        // a delete image then an insert image at the same offset.
        let delete = self.delete_row(rid)?;
        let after = encode_slot(&next)?;
        let mut blocks = self.table.blocks.lock();
        let (start, end) = Self::slot_range(rid.slot);
        let page = &mut blocks[rid.block as usize];
        let before = page[start..end].to_vec();
        page[start..end].copy_from_slice(&after);
        Ok(RowUpdate {
            old_rid: *rid,
            new_rid: *rid,
            delete,
            insert: RowImage {
                block: Block::new(self.path.clone(), rid.block),
                offset: start as u32,
                before,
                after,
            },
        })
    }

    fn live_rids(&self) -> Result<Vec<Rid>> {
        let blocks = self.table.blocks.lock();
        let mut rids = Vec::new();
        if let Some(page) = blocks.get(self.block as usize) {
            for slot in 0..SLOTS_PER_PAGE as u32 {
                let (start, _) = Self::slot_range(slot);
                if page[start] == SLOT_LIVE {
                    rids.push(Rid::new(self.node, self.device, self.block, slot));
                }
            }
        }
        Ok(rids)
    }
}

type IndexMap = BTreeMap<Vec<u8>, Rid>;

/// Factory handing out handles onto shared in-memory index maps.
#[derive(Default)]
pub struct MemIndexFactory {
    indexes: Mutex<HashMap<String, Arc<Mutex<IndexMap>>>>,
}

impl MemIndexFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self, path: &str) -> usize {
        self.indexes
            .lock()
            .get(path)
            .map(|m| m.lock().len())
            .unwrap_or(0)
    }

    pub fn contains(&self, path: &str, key: &[ColValue], rid: &Rid) -> bool {
        let Ok(encoded) = index_key(key, rid) else {
            return false;
        };
        self.indexes
            .lock()
            .get(path)
            .map(|m| m.lock().contains_key(&encoded))
            .unwrap_or(false)
    }
}

fn index_key(key: &[ColValue], rid: &Rid) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(key, rid))?)
}

impl IndexFactory for MemIndexFactory {
    fn open(&self, path: &str, _def: &IndexDef) -> Result<Box<dyn SecondaryIndex>> {
        let map = self
            .indexes
            .lock()
            .entry(path.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MemIndex { map }))
    }
}

struct MemIndex {
    map: Arc<Mutex<IndexMap>>,
}

impl SecondaryIndex for MemIndex {
    fn insert(&mut self, key: &[ColValue], rid: Rid) -> Result<()> {
        self.map.lock().insert(index_key(key, &rid)?, rid);
        Ok(())
    }

    fn delete(&mut self, key: &[ColValue], rid: Rid) -> Result<()> {
        self.map.lock().remove(&index_key(key, &rid)?);
        Ok(())
    }

    fn update(&mut self, key: &[ColValue], old: Rid, new: Rid) -> Result<()> {
        let mut map = self.map.lock();
        map.remove(&index_key(key, &old)?);
        map.insert(index_key(key, &new)?, new);
        Ok(())
    }

    fn mass_delete(&mut self) -> Result<()> {
        self.map.lock().clear();
        Ok(())
    }
}

/// Static cluster roster: node hostnames and device roots fixed at boot.
pub struct StaticCatalog {
    hosts: Vec<String>,
    device_paths: Vec<String>,
}

impl StaticCatalog {
    pub fn new(hosts: Vec<String>, device_paths: Vec<String>) -> Self {
        Self { hosts, device_paths }
    }
}

impl Catalog for StaticCatalog {
    fn host_for_node(&self, node: i32) -> Result<String> {
        self.hosts
            .get(node as usize)
            .cloned()
            .ok_or_else(|| GridError::App(format!("unknown node {node}")))
    }

    fn device_path(&self, device: i32) -> Result<String> {
        self.device_paths
            .get(device as usize)
            .cloned()
            .ok_or_else(|| GridError::App(format!("unknown device {device}")))
    }

    fn device_count(&self) -> usize {
        self.device_paths.len()
    }

    fn determine_device(&self, row: &[ColValue], part: &PartitionMeta) -> i32 {
        let mut h: u64 = 0;
        for pos in &part.cols {
            if let Some(v) = row.get(*pos) {
                h = h.wrapping_mul(31).wrapping_add(v.hash_code());
            }
        }
        (h % self.device_count().max(1) as u64) as i32
    }
}
