//! Device-sharded DML execution.
//!
//! Rows are partitioned by target device (the partitioning hash for inserts,
//! the RID's device otherwise) and one worker thread per device applies its
//! group: batch page reads by block, mutate rows through the page
//! collaborator (logging flows through the transaction), then open each
//! secondary index once and apply its deltas. The operation succeeds only if
//! every device worker succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::config::NodeConfig;
use crate::core::errors::{GridError, Result};
use crate::dml::{DeleteRequest, InsertRequest, MassDeleteRequest, UpdateRequest, UpdateRow};
use crate::meta::{
    index_file, table_file, Block, Catalog, ColValue, IndexDef, IndexFactory, PageStore, Rid,
    TableSchema, HEADER_BLOCKS,
};
use crate::tx::Transaction;

pub struct ExecutorContext {
    pub pages: Arc<dyn PageStore>,
    pub catalog: Arc<dyn Catalog>,
    pub indexes: Arc<dyn IndexFactory>,
    pub max_batch: usize,
    pub prefetch_request_size: usize,
    pub pages_in_advance: usize,
}

impl ExecutorContext {
    pub fn new(
        cfg: &NodeConfig,
        pages: Arc<dyn PageStore>,
        catalog: Arc<dyn Catalog>,
        indexes: Arc<dyn IndexFactory>,
    ) -> Self {
        Self {
            pages,
            catalog,
            indexes,
            max_batch: cfg.max_batch.max(1),
            prefetch_request_size: cfg.prefetch_request_size.max(1),
            pages_in_advance: cfg.pages_in_advance.max(1),
        }
    }
}

fn join_all<T>(results: Vec<std::thread::Result<Result<T>>>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(Ok(value)) => out.push(value),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(GridError::App("device worker panicked".into())),
        }
    }
    Ok(out)
}

/// Insert a batch, fanned out one worker per destination device.
pub fn flush_insert(ctx: &ExecutorContext, tx: &Transaction, req: &InsertRequest) -> Result<()> {
    let mut by_device: HashMap<i32, Vec<usize>> = HashMap::new();
    for (i, row) in req.rows.iter().enumerate() {
        let device = ctx.catalog.determine_device(row, &req.part);
        by_device.entry(device).or_default().push(i);
    }

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = by_device
            .into_iter()
            .map(|(device, rows)| {
                scope.spawn(move || insert_device(ctx, tx, req, device, &rows))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });
    join_all(results).map(|_| ())
}

fn insert_device(
    ctx: &ExecutorContext,
    tx: &Transaction,
    req: &InsertRequest,
    device: i32,
    rows: &[usize],
) -> Result<()> {
    let device_path = ctx.catalog.device_path(device)?;
    let table_path = table_file(&device_path, &req.schema);
    let block = Block::new(table_path, HEADER_BLOCKS);
    tx.request_page(&block)?;
    let page = tx.read(&block, &req.schema)?;

    let mut inserted: Vec<(Rid, Vec<Vec<ColValue>>)> = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(ctx.max_batch) {
        for &i in chunk {
            let row = &req.rows[i];
            let rid = tx.insert_row(&*page, row)?;
            let keys = req
                .indexes
                .iter()
                .map(|def| def.key_of(row, &req.schema))
                .collect();
            inserted.push((rid, keys));
        }
    }
    debug!(device, rows = inserted.len(), "insert group flushed");

    for (i, def) in req.indexes.iter().enumerate() {
        let mut idx = ctx.indexes.open(&index_file(&device_path, &def.name), def)?;
        for (rid, keys) in &inserted {
            idx.insert(&keys[i], *rid)?;
        }
    }
    Ok(())
}

/// Delete a batch of RIDs, fanned out by the device each RID lives on.
pub fn flush_delete(ctx: &ExecutorContext, tx: &Transaction, req: &DeleteRequest) -> Result<()> {
    let mut by_device: HashMap<i32, Vec<usize>> = HashMap::new();
    for (i, raik) in req.rows.iter().enumerate() {
        by_device.entry(raik.rid.device).or_default().push(i);
    }

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = by_device
            .into_iter()
            .map(|(device, rows)| {
                scope.spawn(move || delete_device(ctx, tx, req, device, &rows))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });
    join_all(results).map(|_| ())
}

fn delete_device(
    ctx: &ExecutorContext,
    tx: &Transaction,
    req: &DeleteRequest,
    device: i32,
    rows: &[usize],
) -> Result<()> {
    let device_path = ctx.catalog.device_path(device)?;
    let table_path = table_file(&device_path, &req.schema);

    let mut by_block: HashMap<u64, Vec<usize>> = HashMap::new();
    for &i in rows {
        by_block.entry(req.rows[i].rid.block).or_default().push(i);
    }

    for (block_num, group) in &by_block {
        let block = Block::new(table_path.clone(), *block_num);
        tx.request_page(&block)?;
        let page = tx.read(&block, &req.schema)?;
        for &i in group {
            tx.delete_row(&*page, &req.rows[i].rid)?;
        }
    }

    for (i, def) in req.indexes.iter().enumerate() {
        let mut idx = ctx.indexes.open(&index_file(&device_path, &def.name), def)?;
        for &r in rows {
            let raik = &req.rows[r];
            idx.delete(&raik.keys[i], raik.rid)?;
        }
    }
    Ok(())
}

/// Update a batch of rows, fanned out by the device each RID lives on.
pub fn flush_update(ctx: &ExecutorContext, tx: &Transaction, req: &UpdateRequest) -> Result<()> {
    let mut by_device: HashMap<i32, Vec<usize>> = HashMap::new();
    for (i, row) in req.rows.iter().enumerate() {
        by_device.entry(row.row.rid.device).or_default().push(i);
    }

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = by_device
            .into_iter()
            .map(|(device, rows)| {
                scope.spawn(move || update_device(ctx, tx, req, device, &rows))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });
    join_all(results).map(|_| ())
}

/// The updated key: start from the shipped current key and substitute the
/// values of any key column being set.
fn updated_key(
    def: &IndexDef,
    schema: &TableSchema,
    old_key: &[ColValue],
    update: &UpdateRow,
) -> Vec<ColValue> {
    let mut key = old_key.to_vec();
    for (k, col_name) in def.key_cols.iter().enumerate() {
        let Some(pos) = schema.col_pos(col_name) else {
            continue;
        };
        if let Some(ci) = update.cols.iter().position(|c| *c == pos) {
            if let Some(value) = update.values.get(ci) {
                key[k] = value.clone();
            }
        }
    }
    key
}

fn update_device(
    ctx: &ExecutorContext,
    tx: &Transaction,
    req: &UpdateRequest,
    device: i32,
    rows: &[usize],
) -> Result<()> {
    let device_path = ctx.catalog.device_path(device)?;
    let table_path = table_file(&device_path, &req.schema);

    let mut by_block: HashMap<u64, Vec<usize>> = HashMap::new();
    for &i in rows {
        by_block.entry(req.rows[i].row.rid.block).or_default().push(i);
    }

    let mut changes: HashMap<usize, crate::meta::RidChange> = HashMap::new();
    for (block_num, group) in &by_block {
        let block = Block::new(table_path.clone(), *block_num);
        tx.request_page(&block)?;
        let page = tx.read(&block, &req.schema)?;
        for &i in group {
            let update = &req.rows[i];
            let change = tx.update_row(&*page, &update.row.rid, &update.cols, &update.values)?;
            changes.insert(i, change);
        }
    }

    for (i, def) in req.indexes.iter().enumerate() {
        let mut idx = ctx.indexes.open(&index_file(&device_path, &def.name), def)?;
        for &r in rows {
            let update = &req.rows[r];
            let old_key = &update.row.keys[i];
            let change = changes[&r];
            if def.overlaps(&update.cols, &req.schema) {
                // key (or key and RID) changed: full delete + insert
                let new_key = updated_key(def, &req.schema, old_key, update);
                idx.delete(old_key, change.old)?;
                idx.insert(&new_key, change.new)?;
            } else {
                idx.update(old_key, change.old, change.new)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MassDeleteOutcome {
    pub rows: u64,
}

/// Truncate the table on every local device: scan all pages through the
/// prefetch pipeline, delete every live row, then mass-delete each index.
/// Returns the number of rows removed.
pub fn mass_delete(ctx: &ExecutorContext, tx: &Transaction, req: &MassDeleteRequest) -> Result<MassDeleteOutcome> {
    let devices: Vec<i32> = (0..ctx.catalog.device_count() as i32).collect();
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = devices
            .into_iter()
            .map(|device| scope.spawn(move || mass_delete_device(ctx, tx, req, device)))
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });
    let rows = join_all(results)?.into_iter().sum();
    Ok(MassDeleteOutcome { rows })
}

fn mass_delete_device(
    ctx: &ExecutorContext,
    tx: &Transaction,
    req: &MassDeleteRequest,
    device: i32,
) -> Result<u64> {
    let device_path = ctx.catalog.device_path(device)?;
    let table_path = table_file(&device_path, &req.schema);
    let num_blocks = ctx.pages.block_count(&table_path)?;

    let mut count = 0u64;
    let mut on_page = HEADER_BLOCKS;
    let mut last_requested = HEADER_BLOCKS.saturating_sub(1);
    while on_page < num_blocks {
        if last_requested.saturating_sub(on_page) < ctx.pages_in_advance as u64 {
            let want = (ctx.prefetch_request_size as u64)
                .min(num_blocks.saturating_sub(last_requested + 1));
            if want > 0 {
                let to_request: Vec<Block> = (0..want)
                    .map(|i| Block::new(table_path.clone(), last_requested + 1 + i))
                    .collect();
                tx.request_pages(&to_request)?;
                last_requested += want;
            }
        }

        let block = Block::new(table_path.clone(), on_page);
        let page = tx.read(&block, &req.schema)?;
        for rid in page.live_rids()? {
            tx.delete_row(&*page, &rid)?;
            count += 1;
        }
        on_page += 1;
    }

    for def in &req.indexes {
        let mut idx = ctx.indexes.open(&index_file(&device_path, &def.name), def)?;
        idx.mass_delete()?;
    }
    debug!(device, rows = count, "mass delete finished on device");
    Ok(count)
}
