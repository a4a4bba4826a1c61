//! The log manager: per-file in-memory tails, batched flush-to-LSN, control
//! record helpers with synchronous durability, and the background flusher.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::core::config::NodeConfig;
use crate::core::errors::{GridError, Result};
use crate::log::iter::{BackwardLogIterator, ForwardLogIterator};
use crate::log::lsn::LsnAllocator;
use crate::log::record::{LogData, LogRecord};
use crate::log::store::LogFile;
use crate::log::{Lsn, TxId};
use crate::meta::PageStore;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct FileState {
    file: LogFile,
    tail: Mutex<VecDeque<LogRecord>>,
    flushed: AtomicU64,
    archiving: AtomicBool,
}

struct Shared {
    target_log_size: u64,
    idle: Duration,
    lsn: LsnAllocator,
    files: Mutex<HashMap<PathBuf, Arc<FileState>>>,
    /// Set after any flush I/O failure; the manager then refuses all work.
    dead: AtomicBool,
    stop: AtomicBool,
    signal_lock: Mutex<()>,
    signal: Condvar,
}

/// Owns every log file on this node. Writers append to an in-memory tail;
/// durability comes from `flush`, either called synchronously (commit,
/// ready, …) or by the background worker draining the heads.
pub struct LogManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(target_log_size: u64, log_clean_sleep_secs: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                target_log_size,
                idle: Duration::from_secs(log_clean_sleep_secs.max(1)),
                lsn: LsnAllocator::new(),
                files: Mutex::new(HashMap::new()),
                dead: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                signal_lock: Mutex::new(()),
                signal: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &NodeConfig) -> Self {
        Self::new(cfg.target_log_size, cfg.log_clean_sleep_secs)
    }

    /// Register a log file, creating it if missing. Idempotent.
    pub fn attach(&self, path: &Path) -> Result<()> {
        self.ensure_alive()?;
        let mut files = self.shared.files.lock();
        if !files.contains_key(path) {
            let file = LogFile::open(path)?;
            files.insert(
                path.to_path_buf(),
                Arc::new(FileState {
                    file,
                    tail: Mutex::new(VecDeque::new()),
                    flushed: AtomicU64::new(0),
                    archiving: AtomicBool::new(false),
                }),
            );
            info!(path = %path.display(), "attached log file");
        }
        Ok(())
    }

    fn state(&self, path: &Path) -> Result<Arc<FileState>> {
        self.shared
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| GridError::App(format!("log file not attached: {}", path.display())))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.shared.dead.load(Ordering::Acquire) {
            return Err(GridError::LogDead);
        }
        Ok(())
    }

    /// Stamp an LSN and timestamp and append to the file's tail. The LSN is
    /// taken under the tail lock so tail order always equals LSN order.
    pub fn write(&self, body: LogData, path: &Path) -> Result<Lsn> {
        self.ensure_alive()?;
        let state = self.state(path)?;
        let mut tail = state.tail.lock();
        let lsn = self.shared.lsn.next();
        tail.push_back(LogRecord { lsn, timestamp: now_ms(), body });
        Ok(lsn)
    }

    /// Drain every tail record with `lsn <= up_to` to disk, in LSN order,
    /// then sync once. An I/O failure here poisons the manager.
    pub fn flush(&self, up_to: Lsn, path: &Path) -> Result<()> {
        self.ensure_alive()?;
        let state = self.state(path)?;
        self.flush_state(&state, up_to)
    }

    fn flush_state(&self, state: &Arc<FileState>, up_to: Lsn) -> Result<()> {
        Self::drain_tail(&self.shared, state, up_to)
    }

    fn drain_tail(shared: &Shared, state: &Arc<FileState>, up_to: Lsn) -> Result<()> {
        let mut tail = state.tail.lock();
        let mut wrote = false;
        let mut len = 0u64;
        let mut highest = 0;
        while let Some(front) = tail.front() {
            if front.lsn > up_to {
                break;
            }
            match state.file.append_framed(&front.encode()) {
                Ok(new_len) => {
                    len = new_len;
                    highest = front.lsn;
                    tail.pop_front();
                    wrote = true;
                }
                Err(e) => {
                    shared.dead.store(true, Ordering::Release);
                    error!(error = %e, path = %state.file.path().display(), "log flush failed");
                    return Err(e);
                }
            }
        }
        if wrote {
            if let Err(e) = state.file.sync() {
                shared.dead.store(true, Ordering::Release);
                error!(error = %e, path = %state.file.path().display(), "log sync failed");
                return Err(e);
            }
            state.flushed.fetch_max(highest, Ordering::AcqRel);
            if len > shared.target_log_size {
                Self::schedule_archive(state);
            }
        }
        Ok(())
    }

    fn schedule_archive(state: &Arc<FileState>) {
        if state.archiving.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = Arc::clone(state);
        std::thread::spawn({
            let path = state.file.path().to_path_buf();
            move || match state.file.archive() {
                Ok(segment) => {
                    state.archiving.store(false, Ordering::Release);
                    info!(path = %path.display(), segment = %segment.display(), "archived log file");
                }
                Err(e) => {
                    state.archiving.store(false, Ordering::Release);
                    warn!(error = %e, path = %path.display(), "log archival failed");
                }
            }
        });
    }

    /// Flush everything currently in the tail.
    pub fn flush_all(&self, path: &Path) -> Result<()> {
        let state = self.state(path)?;
        let last = state.tail.lock().back().map(|r| r.lsn);
        match last {
            Some(lsn) => self.flush_state(&state, lsn),
            None => Ok(()),
        }
    }

    /// Highest LSN known durable for this file. Buffer pools gate dirty page
    /// writes on this (the WAL rule).
    pub fn flushed_lsn(&self, path: &Path) -> Result<Lsn> {
        Ok(self.state(path)?.flushed.load(Ordering::Acquire))
    }

    pub fn insert(
        &self,
        tx: TxId,
        block: crate::meta::Block,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
        path: &Path,
    ) -> Result<Lsn> {
        self.write(LogData::Insert { tx, block, offset, before, after }, path)
    }

    pub fn delete(
        &self,
        tx: TxId,
        block: crate::meta::Block,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
        path: &Path,
    ) -> Result<Lsn> {
        self.write(LogData::Delete { tx, block, offset, before, after }, path)
    }

    pub fn start(&self, tx: TxId, path: &Path) -> Result<Lsn> {
        self.write(LogData::Start { tx }, path)
    }

    /// Synchronous durability boundary: the record is on disk when this
    /// returns.
    pub fn commit(&self, tx: TxId, path: &Path) -> Result<()> {
        let lsn = self.write(LogData::Commit { tx }, path)?;
        self.flush(lsn, path)
    }

    pub fn ready(&self, tx: TxId, coordinator: &str, path: &Path) -> Result<()> {
        let lsn = self.write(
            LogData::Ready { tx, coordinator: coordinator.to_string() },
            path,
        )?;
        self.flush(lsn, path)
    }

    pub fn not_ready(&self, tx: TxId, path: &Path) -> Result<()> {
        let lsn = self.write(LogData::NotReady { tx }, path)?;
        self.flush(lsn, path)
    }

    /// Undo every mutation of `tx` back to its `Start`, then durably record
    /// the rollback.
    pub fn rollback(&self, tx: TxId, path: &Path, pages: &dyn PageStore) -> Result<()> {
        self.flush_all(path)?;
        {
            let iter = self.iterator(path)?;
            for rec in iter {
                let rec = rec?;
                if rec.tx() != tx {
                    continue;
                }
                match rec.body {
                    LogData::Start { .. } => break,
                    LogData::Insert { .. } | LogData::Delete { .. } => rec.undo(pages)?,
                    _ => {}
                }
            }
        }
        let lsn = self.write(LogData::Rollback { tx }, path)?;
        self.flush(lsn, path)
    }

    /// Reverse scan over the persisted file (newest record first).
    pub fn iterator(&self, path: &Path) -> Result<BackwardLogIterator> {
        BackwardLogIterator::new(path)
    }

    /// Forward scan over the persisted file (oldest record first).
    pub fn forward_iterator(&self, path: &Path) -> Result<ForwardLogIterator> {
        ForwardLogIterator::new(path)
    }

    /// Spawn the background worker that drains tail heads, idling for
    /// `log_clean_sleep_secs` when every tail is empty.
    pub fn start_flusher(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("log-flusher".into())
            .spawn(move || loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                let states: Vec<Arc<FileState>> =
                    shared.files.lock().values().cloned().collect();
                let mut nothing = true;
                for state in states {
                    let head = state.tail.lock().front().map(|r| r.lsn);
                    if let Some(lsn) = head {
                        nothing = false;
                        if LogManager::drain_tail(&shared, &state, lsn).is_err() {
                            // drain_tail already poisoned the manager
                            return;
                        }
                    }
                }
                if nothing {
                    let mut guard = shared.signal_lock.lock();
                    shared.signal.wait_for(&mut guard, shared.idle);
                }
            })
            .expect("spawning the log flusher never fails");
        *self.worker.lock() = Some(handle);
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.signal.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
