//! ARIES-style recovery: a backward analysis/undo pass, a forward redo pass,
//! then completion of transactions whose coordinator decided COMMIT.
//!
//! Runs once per log file at startup and again whenever a log file is
//! attached at runtime. In-doubt transactions (a `Ready` with no locally
//! known outcome) consult the coordinator through [`RecoveryOutcomes`];
//! coordinator-side decision records resume their phase-2 broadcasts through
//! the same seam.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::core::errors::{GridError, Result};
use crate::log::record::LogData;
use crate::log::{LogManager, TxId};
use crate::meta::PageStore;

/// How recovery reaches the rest of the cluster. Production wires this to
/// the XA manager and tree dispatcher; tests substitute fakes.
pub trait RecoveryOutcomes: Send + Sync {
    /// Ask the coordinator at `host` for the outcome of `tx` (CHECKTX).
    /// `Ok(true)` means COMMIT. An error means the coordinator is
    /// unreachable; the caller must block rather than guess.
    fn ask_coordinator(&self, tx: TxId, host: &str) -> Result<bool>;

    /// Resume a phase-2 commit broadcast to the given participants.
    fn phase2_commit(&self, tx: TxId, nodes: &[i32]) -> Result<()>;

    /// Resume a phase-2 abort broadcast for an already-logged decision.
    fn phase2_abort(&self, tx: TxId, nodes: &[i32]) -> Result<()>;

    /// A `Prepare` whose decision was lost with the crash: durably decide
    /// ABORT, then broadcast. Defaults to the plain abort broadcast.
    fn decide_abort(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        self.phase2_abort(tx, nodes)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: usize,
    pub rolled_back: usize,
    pub undone: usize,
    pub redone: usize,
    pub resumed_commits: usize,
    pub resumed_aborts: usize,
}

pub struct RecoveryEngine<'a> {
    log: &'a LogManager,
    pages: &'a dyn PageStore,
    outcomes: &'a dyn RecoveryOutcomes,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(
        log: &'a LogManager,
        pages: &'a dyn PageStore,
        outcomes: &'a dyn RecoveryOutcomes,
    ) -> Self {
        Self { log, pages, outcomes }
    }

    pub fn recover(&self, path: &Path) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut committed: HashSet<TxId> = HashSet::new();
        let mut rolled_back: HashSet<TxId> = HashSet::new();
        let mut needs_commit: HashSet<TxId> = HashSet::new();
        let mut xa_committed: HashSet<TxId> = HashSet::new();
        let mut xa_rolled_back: HashSet<TxId> = HashSet::new();

        {
            let iter = self.log.iterator(path)?;
            for rec in iter {
                let rec = rec?;
                let tx = rec.tx();
                match &rec.body {
                    LogData::Commit { .. } => {
                        committed.insert(tx);
                    }
                    LogData::Rollback { .. } | LogData::NotReady { .. } => {
                        rolled_back.insert(tx);
                    }
                    LogData::Ready { coordinator, .. } => {
                        if committed.contains(&tx) || rolled_back.contains(&tx) {
                            continue;
                        }
                        match self.outcomes.ask_coordinator(tx, coordinator) {
                            Ok(true) => {
                                committed.insert(tx);
                                needs_commit.insert(tx);
                            }
                            Ok(false) => {
                                rolled_back.insert(tx);
                            }
                            Err(e) => {
                                warn!(tx, coordinator = %coordinator, error = %e,
                                    "coordinator unreachable for in-doubt transaction");
                                return Err(GridError::InDoubt(tx));
                            }
                        }
                    }
                    LogData::XACommit { nodes, .. } => {
                        self.outcomes.phase2_commit(tx, nodes)?;
                        xa_committed.insert(tx);
                        report.resumed_commits += 1;
                    }
                    LogData::XAAbort { nodes, .. } => {
                        self.outcomes.phase2_abort(tx, nodes)?;
                        xa_rolled_back.insert(tx);
                        report.resumed_aborts += 1;
                    }
                    LogData::Prepare { nodes, .. } => {
                        if !xa_committed.contains(&tx) && !xa_rolled_back.contains(&tx) {
                            // the decision was lost with the crash: abort
                            self.outcomes.decide_abort(tx, nodes)?;
                            xa_rolled_back.insert(tx);
                            report.resumed_aborts += 1;
                        }
                    }
                    LogData::Insert { .. } | LogData::Delete { .. } => {
                        if !committed.contains(&tx) && !rolled_back.contains(&tx) {
                            rec.undo(self.pages)?;
                            report.undone += 1;
                        }
                    }
                    LogData::Start { .. } | LogData::NQCheck { .. } => {}
                }
            }
        }

        {
            let iter = self.log.forward_iterator(path)?;
            for rec in iter {
                let rec = rec?;
                if let LogData::Insert { .. } | LogData::Delete { .. } = rec.body {
                    if committed.contains(&rec.tx()) {
                        rec.redo(self.pages)?;
                        report.redone += 1;
                    }
                }
            }
        }

        for tx in &needs_commit {
            self.log.commit(*tx, path)?;
        }

        let lsn = self.log.write(LogData::NQCheck { active: Vec::new() }, path)?;
        self.log.flush(lsn, path)?;

        report.committed = committed.len();
        report.rolled_back = rolled_back.len();
        info!(
            path = %path.display(),
            committed = report.committed,
            rolled_back = report.rolled_back,
            undone = report.undone,
            redone = report.redone,
            "log recovery complete"
        );
        Ok(report)
    }
}

/// Recovery hooks for a node that coordinates nothing and holds no in-doubt
/// transactions (and for tests that want recovery to fail loudly if the
/// cluster is consulted).
pub struct NoOutcomes;

impl RecoveryOutcomes for NoOutcomes {
    fn ask_coordinator(&self, tx: TxId, host: &str) -> Result<bool> {
        Err(GridError::Net(format!(
            "no recovery path to coordinator {host} for transaction {tx}"
        )))
    }

    fn phase2_commit(&self, _tx: TxId, _nodes: &[i32]) -> Result<()> {
        Ok(())
    }

    fn phase2_abort(&self, _tx: TxId, _nodes: &[i32]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::LogData;
    use crate::meta::memory::MemPageStore;
    use crate::meta::Block;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedOutcomes {
        commit_answers: Mutex<std::collections::HashMap<TxId, bool>>,
        commits: Mutex<Vec<(TxId, Vec<i32>)>>,
        aborts: Mutex<Vec<(TxId, Vec<i32>)>>,
    }

    impl ScriptedOutcomes {
        fn answer(self, tx: TxId, commit: bool) -> Self {
            self.commit_answers.lock().insert(tx, commit);
            self
        }
    }

    impl RecoveryOutcomes for ScriptedOutcomes {
        fn ask_coordinator(&self, tx: TxId, _host: &str) -> Result<bool> {
            self.commit_answers
                .lock()
                .get(&tx)
                .copied()
                .ok_or_else(|| GridError::Net("unreachable".into()))
        }

        fn phase2_commit(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
            self.commits.lock().push((tx, nodes.to_vec()));
            Ok(())
        }

        fn phase2_abort(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
            self.aborts.lock().push((tx, nodes.to_vec()));
            Ok(())
        }
    }

    fn setup(dir: &Path) -> (LogManager, PathBuf) {
        let path = dir.join("active.log");
        let mgr = LogManager::new(1024 * 1024, 1);
        mgr.attach(&path).unwrap();
        (mgr, path)
    }

    fn block() -> Block {
        Block::new("/dev0/s.t.tbl", 1)
    }

    #[test]
    fn committed_mutations_are_redone_uncommitted_are_undone() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        // tx 1 committed, tx 2 in flight at crash
        mgr.start(1, &path).unwrap();
        mgr.insert(1, block(), 0, vec![0u8; 4], vec![1u8; 4], &path)
            .unwrap();
        mgr.commit(1, &path).unwrap();
        mgr.start(2, &path).unwrap();
        mgr.insert(2, block(), 8, vec![0u8; 4], vec![2u8; 4], &path)
            .unwrap();
        mgr.flush_all(&path).unwrap();
        // pages lost in the crash: both slots read as zero

        let outcomes = ScriptedOutcomes::default();
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        let report = engine.recover(&path).unwrap();
        assert_eq!(report.redone, 1);
        assert_eq!(report.undone, 1);

        let bytes = pages.snapshot(&block()).unwrap();
        assert_eq!(&bytes[0..4], &[1u8; 4]);
        assert_eq!(&bytes[8..12], &[0u8; 4]);
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        mgr.start(1, &path).unwrap();
        mgr.insert(1, block(), 0, vec![0u8; 4], vec![7u8; 4], &path)
            .unwrap();
        mgr.commit(1, &path).unwrap();

        let outcomes = ScriptedOutcomes::default();
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        engine.recover(&path).unwrap();
        let once = pages.snapshot(&block()).unwrap();
        engine.recover(&path).unwrap();
        engine.recover(&path).unwrap();
        let thrice = pages.snapshot(&block()).unwrap();
        assert_eq!(once, thrice);
    }

    #[test]
    fn ready_with_commit_outcome_completes_locally() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        mgr.start(42, &path).unwrap();
        mgr.insert(42, block(), 0, vec![0u8; 4], vec![5u8; 4], &path)
            .unwrap();
        mgr.ready(42, "coord0", &path).unwrap();

        let outcomes = ScriptedOutcomes::default().answer(42, true);
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        let report = engine.recover(&path).unwrap();
        assert_eq!(report.redone, 1);
        assert_eq!(&pages.snapshot(&block()).unwrap()[0..4], &[5u8; 4]);

        // a local Commit record was written for the in-doubt transaction
        let committed = mgr
            .forward_iterator(&path)
            .unwrap()
            .filter_map(|r| r.ok())
            .any(|r| matches!(r.body, LogData::Commit { tx: 42 }));
        assert!(committed);
    }

    #[test]
    fn ready_with_abort_outcome_rolls_back() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        mgr.start(42, &path).unwrap();
        mgr.insert(42, block(), 0, vec![0u8; 4], vec![5u8; 4], &path)
            .unwrap();
        mgr.ready(42, "coord0", &path).unwrap();
        // the crash lost the in-memory page, but replay the mutation so the
        // undo has something to reverse
        pages.apply(&block(), 0, &[5u8; 4]).unwrap();

        let outcomes = ScriptedOutcomes::default().answer(42, false);
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        let report = engine.recover(&path).unwrap();
        assert_eq!(report.undone, 1);
        assert_eq!(report.redone, 0);
        assert_eq!(&pages.snapshot(&block()).unwrap()[0..4], &[0u8; 4]);
    }

    #[test]
    fn unreachable_coordinator_blocks_recovery() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        mgr.ready(42, "coord0", &path).unwrap();
        let outcomes = ScriptedOutcomes::default();
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        assert!(matches!(
            engine.recover(&path),
            Err(GridError::InDoubt(42))
        ));
    }

    #[test]
    fn prepare_without_decision_aborts() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        let lsn = mgr
            .write(LogData::Prepare { tx: 42, nodes: vec![1, 2] }, &path)
            .unwrap();
        mgr.flush(lsn, &path).unwrap();

        let outcomes = ScriptedOutcomes::default();
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        engine.recover(&path).unwrap();
        assert_eq!(*outcomes.aborts.lock(), vec![(42, vec![1, 2])]);
        assert!(outcomes.commits.lock().is_empty());
    }

    #[test]
    fn decided_prepare_resumes_the_decision() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        let l1 = mgr
            .write(LogData::Prepare { tx: 42, nodes: vec![1, 2] }, &path)
            .unwrap();
        mgr.flush(l1, &path).unwrap();
        let l2 = mgr
            .write(LogData::XACommit { tx: 42, nodes: vec![1, 2] }, &path)
            .unwrap();
        mgr.flush(l2, &path).unwrap();

        let outcomes = ScriptedOutcomes::default();
        let engine = RecoveryEngine::new(&mgr, &pages, &outcomes);
        engine.recover(&path).unwrap();
        assert_eq!(*outcomes.commits.lock(), vec![(42, vec![1, 2])]);
        assert!(outcomes.aborts.lock().is_empty());
    }

    #[test]
    fn recovery_terminates_with_an_empty_nqcheck() {
        let dir = tempdir().unwrap();
        let (mgr, path) = setup(dir.path());
        let pages = MemPageStore::new(0);

        mgr.commit(1, &path).unwrap();
        let outcomes = ScriptedOutcomes::default();
        RecoveryEngine::new(&mgr, &pages, &outcomes)
            .recover(&path)
            .unwrap();

        let last = mgr.iterator(&path).unwrap().next().unwrap().unwrap();
        assert_eq!(last.body, LogData::NQCheck { active: vec![] });
    }
}
