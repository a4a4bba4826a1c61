//! Tree dispatcher: n-ary spanning-tree broadcasts of prepare, phase-2
//! commit/rollback, and mass-delete, with per-branch repair.
//!
//! Sibling subtrees proceed concurrently on their own threads; a subtree is
//! fully visited before its branch thread returns. A PREPARE failure is a NO
//! vote; a phase-2 or mass-delete failure blacklists the unreachable root,
//! queues the command for redelivery, rebuilds the subtree around a
//! surviving descendant, and dispatches again.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use tracing::warn;

use crate::core::config::NodeConfig;
use crate::core::errors::{GridError, Result};
use crate::dml::{DeleteRequest, InsertRequest, MassDeleteRequest, UpdateRequest};
use crate::log::TxId;
use crate::net::blacklist::{Blacklist, DeferredCommand, DeferredOp, RetrySender};
use crate::net::frame;
use crate::net::tree::{self, TreeNode};

/// Cheap to clone: broadcast branch threads each carry their own handle.
#[derive(Clone)]
pub struct Dispatcher {
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_neighbors: usize,
    blacklist: Arc<Blacklist>,
}

/// The subtree payload a branch's root receives: itself first, then the rest
/// of its subtree.
fn branch_payload(branch: TreeNode) -> Vec<TreeNode> {
    match branch {
        TreeNode::Host(h) => vec![TreeNode::Host(h)],
        TreeNode::Branch(children) => children,
    }
}

impl Dispatcher {
    pub fn new(cfg: &NodeConfig, blacklist: Arc<Blacklist>) -> Self {
        Self {
            port: cfg.port_number,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            max_neighbors: cfg.max_neighbor_nodes,
            blacklist,
        }
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn make_tree(&self, hosts: &[String]) -> Vec<TreeNode> {
        tree::make_tree(hosts, self.max_neighbors)
    }

    fn connect(&self, host: &str) -> Result<TcpStream> {
        // a host may carry an explicit port ("10.0.0.1:4001"); otherwise the
        // cluster-wide listener port applies
        let mut addrs = if host.contains(':') {
            host.to_socket_addrs()
        } else {
            (host, self.port).to_socket_addrs()
        }
        .map_err(|e| GridError::Net(format!("resolve {host}: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| GridError::Net(format!("no address for {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| GridError::Net(format!("connect {host}: {e}")))?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Phase-1 broadcast. Returns true only if every branch confirms; any
    /// unreachable or refusing branch is a NO vote.
    pub fn prepare(&self, tx: TxId, coordinator: &str, roots: &[TreeNode]) -> bool {
        let handles: Vec<_> = roots
            .iter()
            .cloned()
            .map(|branch| {
                let dispatch = self.clone();
                let coordinator = coordinator.to_string();
                std::thread::spawn(move || dispatch.prepare_branch(tx, &coordinator, branch))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .fold(true, |acc, vote| acc && vote)
    }

    fn prepare_branch(&self, tx: TxId, coordinator: &str, branch: TreeNode) -> bool {
        let subtree = branch_payload(branch);
        let Some(target) = tree::first_host(&subtree).map(str::to_string) else {
            return true;
        };
        match self.send_prepare(&target, tx, coordinator, &subtree) {
            Ok(vote) => vote,
            Err(e) => {
                warn!(tx, host = %target, error = %e, "prepare branch failed; voting NO");
                false
            }
        }
    }

    fn send_prepare(
        &self,
        target: &str,
        tx: TxId,
        coordinator: &str,
        subtree: &[TreeNode],
    ) -> Result<bool> {
        let mut stream = self.connect(target)?;
        frame::write_request_header(&mut stream, frame::PREPARE, tx)?;
        frame::write_str(&mut stream, coordinator)?;
        frame::write_obj(&mut stream, &subtree)?;
        frame::read_vote(&mut stream)
    }

    /// Phase-2 commit broadcast. Must eventually reach every host: branch
    /// failures defer rather than fail.
    pub fn commit(&self, tx: TxId, roots: Vec<TreeNode>) {
        self.eventual(frame::LCOMMIT, tx, roots, &DeferredCommand::Commit);
    }

    /// Phase-2 abort broadcast, same delivery guarantee as commit.
    pub fn rollback(&self, tx: TxId, roots: Vec<TreeNode>) {
        self.eventual(frame::LROLLBCK, tx, roots, &DeferredCommand::Rollback);
    }

    fn eventual(
        &self,
        cmd: [u8; frame::COMMAND_LEN],
        tx: TxId,
        roots: Vec<TreeNode>,
        command: &DeferredCommand,
    ) {
        let handles: Vec<_> = roots
            .into_iter()
            .map(|branch| {
                let dispatch = self.clone();
                let command = command.clone();
                std::thread::spawn(move || dispatch.eventual_branch(cmd, tx, branch, command))
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn eventual_branch(
        &self,
        cmd: [u8; frame::COMMAND_LEN],
        tx: TxId,
        branch: TreeNode,
        command: DeferredCommand,
    ) {
        let mut subtree = branch_payload(branch);
        loop {
            let Some(target) = tree::first_host(&subtree).map(str::to_string) else {
                return;
            };
            match self.send_eventual(&target, cmd, tx, &subtree) {
                Ok(()) => return,
                Err(e) => {
                    warn!(tx, host = %target, error = %e, "branch unreachable; deferring");
                    self.blacklist.blacklist(&target);
                    self.blacklist
                        .defer(&target, DeferredOp { tx, command: command.clone() });
                    match tree::rebuild_without(&subtree, &target, self.max_neighbors) {
                        Some(rest) => subtree = rest,
                        None => return,
                    }
                }
            }
        }
    }

    fn send_eventual(
        &self,
        target: &str,
        cmd: [u8; frame::COMMAND_LEN],
        tx: TxId,
        subtree: &[TreeNode],
    ) -> Result<()> {
        let mut stream = self.connect(target)?;
        frame::write_request_header(&mut stream, cmd, tx)?;
        frame::write_obj(&mut stream, &subtree)?;
        frame::read_confirmation(&mut stream)
    }

    /// Mass-delete broadcast. Returns the summed row count from every host
    /// it reached; unreachable hosts get the command through the deferred
    /// queue and report nothing.
    pub fn mass_delete(&self, tx: TxId, req: &MassDeleteRequest, roots: Vec<TreeNode>) -> u64 {
        let handles: Vec<_> = roots
            .into_iter()
            .map(|branch| {
                let dispatch = self.clone();
                let req = req.clone();
                std::thread::spawn(move || dispatch.mass_delete_branch(tx, &req, branch))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or(0)).sum()
    }

    fn mass_delete_branch(&self, tx: TxId, req: &MassDeleteRequest, branch: TreeNode) -> u64 {
        let mut subtree = branch_payload(branch);
        loop {
            let Some(target) = tree::first_host(&subtree).map(str::to_string) else {
                return 0;
            };
            match self.send_mass_delete(&target, tx, req, &subtree) {
                Ok(rows) => return rows,
                Err(e) => {
                    warn!(tx, host = %target, error = %e, "mass-delete branch unreachable; deferring");
                    self.blacklist.blacklist(&target);
                    self.blacklist.defer(
                        &target,
                        DeferredOp { tx, command: DeferredCommand::MassDelete(req.clone()) },
                    );
                    match tree::rebuild_without(&subtree, &target, self.max_neighbors) {
                        Some(rest) => subtree = rest,
                        None => return 0,
                    }
                }
            }
        }
    }

    fn send_mass_delete(
        &self,
        target: &str,
        tx: TxId,
        req: &MassDeleteRequest,
        subtree: &[TreeNode],
    ) -> Result<u64> {
        let mut stream = self.connect(target)?;
        frame::write_request_header(&mut stream, frame::MDELETE, tx)?;
        frame::write_str(&mut stream, &req.schema.schema)?;
        frame::write_str(&mut stream, &req.schema.table)?;
        frame::write_obj(&mut stream, &subtree)?;
        frame::write_obj(&mut stream, req)?;
        frame::read_confirmation(&mut stream)?;
        Ok(read_u64(&mut stream)?)
    }

    /// CHECKTX: ask a coordinator for a transaction's durable outcome.
    pub fn check_tx(&self, host: &str, tx: TxId) -> Result<bool> {
        let mut stream = self.connect(host)?;
        frame::write_request_header(&mut stream, frame::CHECKTX, tx)?;
        frame::read_vote(&mut stream)
    }

    /// Route one DML batch to a worker node.
    pub fn insert(&self, host: &str, tx: TxId, req: &InsertRequest) -> Result<()> {
        self.send_dml(host, frame::INSERT, tx, &req.schema.schema, &req.schema.table, req)
    }

    pub fn delete(&self, host: &str, tx: TxId, req: &DeleteRequest) -> Result<()> {
        self.send_dml(host, frame::DELETE, tx, &req.schema.schema, &req.schema.table, req)
    }

    pub fn update(&self, host: &str, tx: TxId, req: &UpdateRequest) -> Result<()> {
        self.send_dml(host, frame::UPDATE, tx, &req.schema.schema, &req.schema.table, req)
    }

    fn send_dml<T: serde::Serialize>(
        &self,
        host: &str,
        cmd: [u8; frame::COMMAND_LEN],
        tx: TxId,
        schema: &str,
        table: &str,
        req: &T,
    ) -> Result<()> {
        let mut stream = self.connect(host)?;
        frame::write_request_header(&mut stream, cmd, tx)?;
        frame::write_str(&mut stream, schema)?;
        frame::write_str(&mut stream, table)?;
        frame::write_obj(&mut stream, req)?;
        frame::read_confirmation(&mut stream)
    }

    /// Ask a node to attach and recover an additional log file.
    pub fn add_log(&self, host: &str, path: &str) -> Result<()> {
        let mut stream = self.connect(host)?;
        frame::write_request_header(&mut stream, frame::ADDLOG, 0)?;
        frame::write_str(&mut stream, path)?;
        frame::read_confirmation(&mut stream)
    }

    /// Ask a coordinator to run 2PC for a client transaction.
    pub fn client_commit(&self, host: &str, tx: TxId, nodes: &[i32]) -> Result<bool> {
        let mut stream = self.connect(host)?;
        frame::write_request_header(&mut stream, frame::COMMIT, tx)?;
        frame::write_obj(&mut stream, &nodes)?;
        frame::read_vote(&mut stream)
    }

    pub fn client_rollback(&self, host: &str, tx: TxId, nodes: &[i32]) -> Result<()> {
        let mut stream = self.connect(host)?;
        frame::write_request_header(&mut stream, frame::ROLLBACK, tx)?;
        frame::write_obj(&mut stream, &nodes)?;
        frame::read_confirmation(&mut stream)
    }
}

fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    r.read_u64::<BigEndian>()
}

impl RetrySender for Dispatcher {
    fn deliver(&self, host: &str, op: &DeferredOp) -> Result<()> {
        let single = vec![TreeNode::Host(host.to_string())];
        match &op.command {
            DeferredCommand::Commit => self.send_eventual(host, frame::LCOMMIT, op.tx, &single),
            DeferredCommand::Rollback => self.send_eventual(host, frame::LROLLBCK, op.tx, &single),
            DeferredCommand::MassDelete(req) => {
                self.send_mass_delete(host, op.tx, req, &single).map(|_| ())
            }
        }
    }
}
