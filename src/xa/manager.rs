//! The 2PC coordinator. Owns the XA decision log: `Prepare` is durable
//! before phase 1 starts, the `XACommit`/`XAAbort` decision is durable
//! before phase 2 starts, and `ask_xa` answers participants recovering with
//! an in-doubt `Ready`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::errors::{GridError, Result};
use crate::log::record::LogData;
use crate::log::recovery::RecoveryOutcomes;
use crate::log::{LogManager, TxId};
use crate::meta::Catalog;
use crate::net::dispatch::Dispatcher;

pub struct XaManager {
    log: Arc<LogManager>,
    xa_path: PathBuf,
    dispatch: Arc<Dispatcher>,
    catalog: Arc<dyn Catalog>,
    /// This coordinator's hostname, recorded in participants' `Ready`
    /// records and consulted by their recovery.
    host: String,
}

impl XaManager {
    pub fn new(
        log: Arc<LogManager>,
        xa_path: PathBuf,
        dispatch: Arc<Dispatcher>,
        catalog: Arc<dyn Catalog>,
        host: String,
    ) -> Result<Self> {
        log.attach(&xa_path)?;
        Ok(Self { log, xa_path, dispatch, catalog, host })
    }

    pub fn xa_path(&self) -> &PathBuf {
        &self.xa_path
    }

    fn hosts_of(&self, nodes: &[i32]) -> Result<Vec<String>> {
        nodes
            .iter()
            .map(|n| self.catalog.host_for_node(*n))
            .collect()
    }

    /// Full 2PC: durable `Prepare`, phase-1 fan-out, durable decision,
    /// phase-2 fan-out. Any NO vote or unreachable participant aborts.
    pub fn try_commit(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        let lsn = self
            .log
            .write(LogData::Prepare { tx, nodes: nodes.to_vec() }, &self.xa_path)?;
        self.log.flush(lsn, &self.xa_path)?;

        let hosts = self.hosts_of(nodes)?;
        let roots = self.dispatch.make_tree(&hosts);
        let all_yes = self.dispatch.prepare(tx, &self.host, &roots);

        if all_yes {
            let lsn = self
                .log
                .write(LogData::XACommit { tx, nodes: nodes.to_vec() }, &self.xa_path)?;
            self.log.flush(lsn, &self.xa_path)?;
            self.dispatch.commit(tx, roots);
            info!(tx, participants = nodes.len(), "transaction committed");
            Ok(())
        } else {
            let lsn = self
                .log
                .write(LogData::XAAbort { tx, nodes: nodes.to_vec() }, &self.xa_path)?;
            self.log.flush(lsn, &self.xa_path)?;
            self.dispatch.rollback(tx, roots);
            warn!(tx, "phase 1 refused; transaction aborted");
            Err(GridError::Aborted(tx))
        }
    }

    /// Durably decide ABORT, then broadcast phase-2 rollback. Used for
    /// client-initiated rollback and for recovery of an undecided `Prepare`.
    pub fn abort(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        let lsn = self
            .log
            .write(LogData::XAAbort { tx, nodes: nodes.to_vec() }, &self.xa_path)?;
        self.log.flush(lsn, &self.xa_path)?;
        self.resume_abort(tx, nodes)
    }

    /// Phase-2 commit broadcast for an already-logged decision.
    pub fn resume_commit(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        let hosts = self.hosts_of(nodes)?;
        let roots = self.dispatch.make_tree(&hosts);
        self.dispatch.commit(tx, roots);
        Ok(())
    }

    /// Phase-2 abort broadcast for an already-logged decision.
    pub fn resume_abort(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        let hosts = self.hosts_of(nodes)?;
        let roots = self.dispatch.make_tree(&hosts);
        self.dispatch.rollback(tx, roots);
        Ok(())
    }

    /// Answer a recovering participant: true iff the XA log holds an
    /// `XACommit` for this transaction. An `XAAbort`, an undecided
    /// `Prepare`, or no record at all answers false; rolling back is always
    /// safe for a transaction we never decided to commit.
    pub fn ask_xa(&self, tx: TxId) -> Result<bool> {
        let iter = self.log.iterator(&self.xa_path)?;
        for rec in iter {
            let rec = rec?;
            if rec.tx() != tx {
                continue;
            }
            match rec.body {
                LogData::XACommit { .. } => return Ok(true),
                LogData::XAAbort { .. } | LogData::Prepare { .. } => return Ok(false),
                _ => {}
            }
        }
        Ok(false)
    }
}

/// Recovery seam wired to the live cluster: in-doubt questions go over
/// CHECKTX, coordinator decisions resume through the XA manager.
pub struct ClusterOutcomes {
    dispatch: Arc<Dispatcher>,
    xa: Option<Arc<XaManager>>,
}

impl ClusterOutcomes {
    pub fn new(dispatch: Arc<Dispatcher>, xa: Option<Arc<XaManager>>) -> Self {
        Self { dispatch, xa }
    }
}

impl RecoveryOutcomes for ClusterOutcomes {
    fn ask_coordinator(&self, tx: TxId, host: &str) -> Result<bool> {
        self.dispatch.check_tx(host, tx)
    }

    fn phase2_commit(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        match &self.xa {
            Some(xa) => xa.resume_commit(tx, nodes),
            None => Ok(()),
        }
    }

    fn phase2_abort(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        match &self.xa {
            Some(xa) => xa.resume_abort(tx, nodes),
            None => Ok(()),
        }
    }

    fn decide_abort(&self, tx: TxId, nodes: &[i32]) -> Result<()> {
        // the lost decision becomes a durable abort before any broadcast
        match &self.xa {
            Some(xa) => xa.abort(tx, nodes),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NodeConfig;
    use crate::meta::memory::StaticCatalog;
    use crate::net::blacklist::Blacklist;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fixture(hosts: Vec<String>) -> (Arc<XaManager>, Arc<LogManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let cfg = NodeConfig::new()
            .log_dir(dir.path())
            .max_neighbor_nodes(4);
        let cfg = NodeConfig {
            connect_timeout_ms: 100,
            read_timeout_ms: 200,
            ..cfg
        };
        let log = Arc::new(LogManager::from_config(&cfg));
        let blacklist = Arc::new(Blacklist::new(Duration::from_millis(50)));
        let dispatch = Arc::new(Dispatcher::new(&cfg, blacklist));
        let catalog = Arc::new(StaticCatalog::new(hosts, vec!["/d0".into()]));
        let xa = XaManager::new(
            Arc::clone(&log),
            cfg.xa_log_path(),
            dispatch,
            catalog,
            "coord0".into(),
        )
        .unwrap();
        (Arc::new(xa), log, dir)
    }

    #[test]
    fn ask_xa_reads_the_decision() {
        let (xa, log, _dir) = fixture(vec![]);
        let path = xa.xa_path().clone();

        assert!(!xa.ask_xa(1).unwrap());

        let lsn = log
            .write(LogData::Prepare { tx: 1, nodes: vec![0] }, &path)
            .unwrap();
        log.flush(lsn, &path).unwrap();
        assert!(!xa.ask_xa(1).unwrap(), "undecided prepare answers NO");

        let lsn = log
            .write(LogData::XACommit { tx: 1, nodes: vec![0] }, &path)
            .unwrap();
        log.flush(lsn, &path).unwrap();
        assert!(xa.ask_xa(1).unwrap());

        let lsn = log
            .write(LogData::XAAbort { tx: 2, nodes: vec![0] }, &path)
            .unwrap();
        log.flush(lsn, &path).unwrap();
        assert!(!xa.ask_xa(2).unwrap());
    }

    #[test]
    fn unreachable_participant_aborts_and_logs_both_records() {
        // port 1 is never listening; phase 1 must fail fast
        let (xa, log, _dir) = fixture(vec!["127.0.0.1:1".into()]);
        let err = xa.try_commit(42, &[0]).unwrap_err();
        assert!(matches!(err, GridError::Aborted(42)));

        let bodies: Vec<_> = log
            .forward_iterator(xa.xa_path())
            .unwrap()
            .map(|r| r.unwrap().body)
            .collect();
        assert!(matches!(bodies[0], LogData::Prepare { tx: 42, .. }));
        assert!(matches!(bodies[1], LogData::XAAbort { tx: 42, .. }));
        assert!(!xa.ask_xa(42).unwrap());
    }

    #[test]
    fn abort_is_durable_before_broadcast() {
        let (xa, _log, _dir) = fixture(vec!["127.0.0.1:1".into()]);
        xa.abort(7, &[0]).unwrap();
        assert!(!xa.ask_xa(7).unwrap());
    }
}
