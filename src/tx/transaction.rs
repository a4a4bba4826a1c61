//! Node-local transaction: tracks mutations, drives the log for every row
//! operation, and implements the participant half of 2PC.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::core::errors::Result;
use crate::log::{LogManager, TxId};
use crate::meta::{Block, ColValue, PageStore, Rid, RidChange, RowPage, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    CursorStability,
}

/// One transaction on one node. Row mutations flow through here so that
/// every change is logged with its (before, after) images before the page
/// leaves memory.
pub struct Transaction {
    id: TxId,
    isolation: IsolationLevel,
    log: Arc<LogManager>,
    pages: Arc<dyn PageStore>,
    log_path: PathBuf,
    started: AtomicBool,
}

impl Transaction {
    pub fn new(
        id: TxId,
        log: Arc<LogManager>,
        pages: Arc<dyn PageStore>,
        log_path: PathBuf,
    ) -> Self {
        Self {
            id,
            isolation: IsolationLevel::ReadCommitted,
            log,
            pages,
            log_path,
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn set_isolation(&mut self, isolation: IsolationLevel) {
        self.isolation = isolation;
    }

    /// The `Start` record is written lazily, before the first mutation.
    fn ensure_started(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.log.start(self.id, &self.log_path)?;
        }
        Ok(())
    }

    pub fn request_page(&self, block: &Block) -> Result<()> {
        self.pages.request_page(block)
    }

    pub fn request_pages(&self, blocks: &[Block]) -> Result<()> {
        self.pages.request_pages(blocks)
    }

    pub fn read(&self, block: &Block, schema: &TableSchema) -> Result<Arc<dyn RowPage>> {
        self.pages.page(block, schema)
    }

    /// Insert a row through the page collaborator and log its after-image.
    pub fn insert_row(&self, page: &dyn RowPage, values: &[ColValue]) -> Result<Rid> {
        self.ensure_started()?;
        let ins = page.insert_row(values)?;
        self.log.insert(
            self.id,
            ins.image.block,
            ins.image.offset,
            ins.image.before,
            ins.image.after,
            &self.log_path,
        )?;
        Ok(ins.rid)
    }

    /// Delete a row and log its before-image.
    pub fn delete_row(&self, page: &dyn RowPage, rid: &Rid) -> Result<()> {
        self.ensure_started()?;
        let img = page.delete_row(rid)?;
        self.log
            .delete(self.id, img.block, img.offset, img.before, img.after, &self.log_path)?;
        Ok(())
    }

    /// Update columns in place, or relocate when the row outgrew its slot.
    /// Logged as a delete image plus an insert image either way.
    pub fn update_row(
        &self,
        page: &dyn RowPage,
        rid: &Rid,
        cols: &[usize],
        values: &[ColValue],
    ) -> Result<RidChange> {
        self.ensure_started()?;
        let upd = page.update_row(rid, cols, values)?;
        self.log.delete(
            self.id,
            upd.delete.block,
            upd.delete.offset,
            upd.delete.before,
            upd.delete.after,
            &self.log_path,
        )?;
        self.log.insert(
            self.id,
            upd.insert.block,
            upd.insert.offset,
            upd.insert.before,
            upd.insert.after,
            &self.log_path,
        )?;
        Ok(RidChange { old: upd.old_rid, new: upd.new_rid })
    }

    /// Durably commit this node's part of the transaction.
    pub fn commit(&self) -> Result<()> {
        self.log.commit(self.id, &self.log_path)
    }

    /// Undo this transaction's mutations and durably record the rollback.
    pub fn rollback(&self) -> Result<()> {
        self.log.rollback(self.id, &self.log_path, &*self.pages)
    }

    /// Participant side of phase 1: make every mutation durable, then vote
    /// YES with a `Ready` naming the coordinator. Any failure becomes a
    /// durable NO vote.
    pub fn try_commit(&self, coordinator: &str) -> Result<()> {
        match self.log.flush_all(&self.log_path) {
            Ok(()) => self.log.ready(self.id, coordinator, &self.log_path),
            Err(e) => {
                warn!(tx = self.id, error = %e, "prepare failed; voting NO");
                self.log.not_ready(self.id, &self.log_path)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::LogData;
    use crate::meta::memory::MemPageStore;
    use crate::meta::{ColDef, ColType};
    use tempfile::tempdir;

    fn schema() -> TableSchema {
        TableSchema {
            schema: "s".into(),
            table: "t".into(),
            cols: vec![
                ColDef { name: "a".into(), ctype: ColType::Int },
                ColDef { name: "b".into(), ctype: ColType::Varchar },
            ],
        }
    }

    fn fixture() -> (Arc<LogManager>, Arc<MemPageStore>, PathBuf, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("active.log");
        let log = Arc::new(LogManager::new(1024 * 1024, 1));
        log.attach(&path).unwrap();
        let pages = Arc::new(MemPageStore::new(0));
        pages.add_device("/dev0", 0);
        (log, pages, path, dir)
    }

    #[test]
    fn mutations_log_start_then_images() {
        let (log, pages, path, _dir) = fixture();
        let tx = Transaction::new(42, Arc::clone(&log), pages.clone(), path.clone());

        let block = Block::new("/dev0/s.t.tbl", 1);
        let page = tx.read(&block, &schema()).unwrap();
        let rid = tx
            .insert_row(&*page, &[ColValue::Int(1), ColValue::Varchar("x".into())])
            .unwrap();
        tx.delete_row(&*page, &rid).unwrap();
        tx.commit().unwrap();

        let bodies: Vec<_> = log
            .forward_iterator(&path)
            .unwrap()
            .map(|r| r.unwrap().body)
            .collect();
        assert!(matches!(bodies[0], LogData::Start { tx: 42 }));
        assert!(matches!(bodies[1], LogData::Insert { tx: 42, .. }));
        assert!(matches!(bodies[2], LogData::Delete { tx: 42, .. }));
        assert!(matches!(bodies[3], LogData::Commit { tx: 42 }));
    }

    #[test]
    fn commit_lsn_follows_all_data_lsns() {
        let (log, pages, path, _dir) = fixture();
        let tx = Transaction::new(7, Arc::clone(&log), pages.clone(), path.clone());

        let block = Block::new("/dev0/s.t.tbl", 1);
        let page = tx.read(&block, &schema()).unwrap();
        for i in 0..10 {
            tx.insert_row(&*page, &[ColValue::Int(i), ColValue::Varchar("r".into())])
                .unwrap();
        }
        tx.commit().unwrap();

        let records: Vec<_> = log
            .forward_iterator(&path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let commit_lsn = records
            .iter()
            .find(|r| matches!(r.body, LogData::Commit { .. }))
            .unwrap()
            .lsn;
        for rec in &records {
            if matches!(rec.body, LogData::Insert { .. }) {
                assert!(rec.lsn < commit_lsn);
            }
        }
    }

    #[test]
    fn rollback_restores_the_page() {
        let (log, pages, path, _dir) = fixture();
        let tx = Transaction::new(9, Arc::clone(&log), pages.clone(), path.clone());

        let block = Block::new("/dev0/s.t.tbl", 1);
        let page = tx.read(&block, &schema()).unwrap();
        tx.insert_row(&*page, &[ColValue::Int(5), ColValue::Varchar("gone".into())])
            .unwrap();
        assert_eq!(page.live_rids().unwrap().len(), 1);

        tx.rollback().unwrap();
        assert!(page.live_rids().unwrap().is_empty());
    }

    #[test]
    fn try_commit_writes_a_flushed_ready() {
        let (log, pages, path, _dir) = fixture();
        let tx = Transaction::new(11, Arc::clone(&log), pages.clone(), path.clone());

        let block = Block::new("/dev0/s.t.tbl", 1);
        let page = tx.read(&block, &schema()).unwrap();
        tx.insert_row(&*page, &[ColValue::Int(1), ColValue::Varchar("v".into())])
            .unwrap();
        tx.try_commit("coord0").unwrap();

        let bodies: Vec<_> = log
            .forward_iterator(&path)
            .unwrap()
            .map(|r| r.unwrap().body)
            .collect();
        assert!(matches!(
            bodies.last(),
            Some(LogData::Ready { tx: 11, coordinator }) if coordinator == "coord0"
        ));
    }

    #[test]
    fn update_logs_delete_then_insert() {
        let (log, pages, path, _dir) = fixture();
        let tx = Transaction::new(13, Arc::clone(&log), pages.clone(), path.clone());

        let block = Block::new("/dev0/s.t.tbl", 1);
        let page = tx.read(&block, &schema()).unwrap();
        let rid = tx
            .insert_row(&*page, &[ColValue::Int(1), ColValue::Varchar("a".into())])
            .unwrap();
        let change = tx
            .update_row(&*page, &rid, &[1], &[ColValue::Varchar("b".into())])
            .unwrap();
        assert_eq!(change.old, change.new);

        let bodies: Vec<_> = log
            .forward_iterator(&path)
            .unwrap()
            .map(|r| r.unwrap().body)
            .collect();
        assert_eq!(bodies.len(), 0, "nothing flushed yet");
        log.flush_all(&path).unwrap();
        let bodies: Vec<_> = log
            .forward_iterator(&path)
            .unwrap()
            .map(|r| r.unwrap().body)
            .collect();
        assert!(matches!(bodies[2], LogData::Delete { tx: 13, .. }));
        assert!(matches!(bodies[3], LogData::Insert { tx: 13, .. }));
    }
}
