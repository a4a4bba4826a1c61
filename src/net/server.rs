//! TCP listener and per-connection worker.
//!
//! One thread services each connection, reading 8-byte commands in a loop
//! and dispatching to the transactional core. Protocol violations answer
//! with an `EXCEPT` frame and close the socket; they have no transactional
//! effect because nothing is durable until a flushed control record says so.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::{debug, info, warn};

use crate::core::config::NodeConfig;
use crate::core::errors::{GridError, Result};
use crate::dml::{self, DeleteRequest, ExecutorContext, InsertRequest, MassDeleteRequest, UpdateRequest};
use crate::log::{LogManager, TxId};
use crate::meta::{Catalog, IndexFactory, PageStore, ResultStreamer};
use crate::net::blacklist::{DeferredCommand, DeferredOp};
use crate::net::dispatch::Dispatcher;
use crate::net::frame;
use crate::net::tree::{self, TreeNode};
use crate::tx::{IsolationLevel, Transaction};
use crate::xa::XaManager;

/// Everything a connection worker needs: the log, the collaborators, the
/// dispatcher, and (on coordinators) the XA manager.
pub struct NodeContext {
    pub cfg: NodeConfig,
    /// This node's name as it appears in spanning trees.
    pub host: String,
    pub log: Arc<LogManager>,
    pub pages: Arc<dyn PageStore>,
    pub catalog: Arc<dyn Catalog>,
    pub indexes: Arc<dyn IndexFactory>,
    pub dispatch: Arc<Dispatcher>,
    pub xa: Option<Arc<XaManager>>,
    pub streamer: Option<Arc<dyn ResultStreamer>>,
}

impl NodeContext {
    /// Attach an additional log file at runtime and recover it before any
    /// new records flow into it.
    pub fn add_log(&self, path: &std::path::Path) -> Result<crate::log::RecoveryReport> {
        self.log.attach(path)?;
        let outcomes =
            crate::xa::ClusterOutcomes::new(Arc::clone(&self.dispatch), self.xa.clone());
        crate::log::RecoveryEngine::new(&self.log, &*self.pages, &outcomes).recover(path)
    }

    pub fn executor(&self) -> ExecutorContext {
        ExecutorContext::new(
            &self.cfg,
            Arc::clone(&self.pages),
            Arc::clone(&self.catalog),
            Arc::clone(&self.indexes),
        )
    }

    pub fn transaction(&self, id: TxId) -> Transaction {
        Transaction::new(
            id,
            Arc::clone(&self.log),
            Arc::clone(&self.pages),
            self.cfg.active_log_path(),
        )
    }
}

/// Per-connection client state.
struct Session {
    isolation: IsolationLevel,
}

impl Default for Session {
    fn default() -> Self {
        Self { isolation: IsolationLevel::ReadCommitted }
    }
}

pub struct Server {
    ctx: Arc<NodeContext>,
    listener: TcpListener,
}

impl Server {
    /// Bind the node's listener. A configured port of 0 picks an ephemeral
    /// port (useful for embedding and tests).
    pub fn bind(ctx: Arc<NodeContext>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", ctx.cfg.port_number))?;
        Self::with_listener(ctx, listener)
    }

    /// Serve on a listener bound by the embedder.
    pub fn with_listener(ctx: Arc<NodeContext>, listener: TcpListener) -> Result<Self> {
        info!(addr = %listener.local_addr()?, "node listening");
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; one worker thread per connection.
    pub fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            let ctx = Arc::clone(&self.ctx);
            std::thread::Builder::new()
                .name(format!("conn-{peer}"))
                .spawn(move || {
                    if let Err(e) = handle_connection(&ctx, stream) {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                })
                .expect("spawning a connection worker never fails");
        }
    }

    /// Run the accept loop on its own thread.
    pub fn spawn(self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = self.local_addr()?;
        let handle = std::thread::Builder::new()
            .name("node-listener".into())
            .spawn(move || {
                if let Err(e) = self.run() {
                    warn!(error = %e, "listener terminated");
                }
            })
            .expect("spawning the listener never fails");
        Ok((addr, handle))
    }
}

fn handle_connection(ctx: &NodeContext, mut stream: TcpStream) -> Result<()> {
    let mut session = Session::default();
    loop {
        let Some(cmd) = frame::read_command(&mut stream)? else {
            return Ok(());
        };
        let outcome = match cmd {
            frame::PREPARE => handle_prepare(ctx, &mut stream),
            frame::LCOMMIT => handle_local_commit(ctx, &mut stream),
            frame::LROLLBCK => handle_local_rollback(ctx, &mut stream),
            frame::CHECKTX => handle_check_tx(ctx, &mut stream),
            frame::INSERT => handle_insert(ctx, &session, &mut stream),
            frame::DELETE => handle_delete(ctx, &session, &mut stream),
            frame::UPDATE => handle_update(ctx, &session, &mut stream),
            frame::MDELETE => handle_mass_delete(ctx, &mut stream),
            frame::COMMIT => handle_client_commit(ctx, &mut stream),
            frame::ROLLBACK => handle_client_rollback(ctx, &mut stream),
            frame::CLIENT => frame::send_ok(&mut stream),
            frame::ISOLATIO => handle_isolation(&mut session, &mut stream),
            frame::TEST => frame::send_ok(&mut stream),
            frame::CLOSE => {
                frame::send_ok(&mut stream)?;
                return Ok(());
            }
            frame::ADDLOG => handle_add_log(ctx, &mut stream),
            frame::REMOTTRE | frame::SNDRMTTR => match &ctx.streamer {
                Some(streamer) => streamer.handle(cmd, &mut stream),
                None => {
                    frame::send_exception(&mut stream, "result streaming is not available")?;
                    return Ok(());
                }
            },
            other => {
                let name = String::from_utf8_lossy(&other).into_owned();
                warn!(command = %name, "unknown command");
                frame::send_exception(&mut stream, &format!("BadCommand: {name}"))?;
                return Ok(());
            }
        };
        if let Err(e) = outcome {
            warn!(error = %e, "request failed");
            let _ = frame::send_exception(&mut stream, &e.to_string());
            return Err(e);
        }
    }
}

/// Peel this node (the leftmost leaf, which the sender addressed) off the
/// received tree, leaving the subtrees to forward to.
fn peel_self(tree: &mut Vec<TreeNode>) {
    if let Some(me) = tree::first_host(tree).map(str::to_string) {
        tree::remove_host(tree, &me);
    }
}

/// Phase 1 on a participant: make the local transaction durable and vote,
/// then gather the votes of the remaining subtrees. Any failure below is a
/// NO vote upward.
fn handle_prepare(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let coordinator = frame::read_str(stream)?;
    let mut tree: Vec<TreeNode> = frame::read_obj(stream)?;

    let tx = ctx.transaction(tx_id);
    if tx.try_commit(&coordinator).is_err() {
        return frame::send_no(stream);
    }

    peel_self(&mut tree);
    if ctx.dispatch.prepare(tx_id, &coordinator, &tree) {
        frame::send_ok(stream)
    } else {
        frame::send_no(stream)
    }
}

/// Phase-2 commit on a participant. The receipt is acknowledged before the
/// local work: the decision is already durable at the coordinator, so this
/// node either applies it now or, if its own commit fails, queues itself
/// for redelivery.
fn handle_local_commit(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let mut tree: Vec<TreeNode> = frame::read_obj(stream)?;
    frame::send_ok(stream)?;

    let tx = ctx.transaction(tx_id);
    if let Err(e) = tx.commit() {
        warn!(tx = tx_id, error = %e, "local commit failed; deferring to self");
        ctx.dispatch.blacklist().blacklist(&ctx.host);
        ctx.dispatch
            .blacklist()
            .defer(&ctx.host, DeferredOp { tx: tx_id, command: DeferredCommand::Commit });
    }

    peel_self(&mut tree);
    ctx.dispatch.commit(tx_id, tree);
    Ok(())
}

/// Phase-2 abort on a participant; mirror of `handle_local_commit`.
fn handle_local_rollback(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let mut tree: Vec<TreeNode> = frame::read_obj(stream)?;
    frame::send_ok(stream)?;

    let tx = ctx.transaction(tx_id);
    if let Err(e) = tx.rollback() {
        warn!(tx = tx_id, error = %e, "local rollback failed; deferring to self");
        ctx.dispatch.blacklist().blacklist(&ctx.host);
        ctx.dispatch
            .blacklist()
            .defer(&ctx.host, DeferredOp { tx: tx_id, command: DeferredCommand::Rollback });
    }

    peel_self(&mut tree);
    ctx.dispatch.rollback(tx_id, tree);
    Ok(())
}

/// A recovering participant asks for a transaction's outcome. Only
/// coordinators can answer; OK means COMMIT.
fn handle_check_tx(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let Some(xa) = &ctx.xa else {
        return Err(GridError::Protocol("CHECKTX sent to a non-coordinator".into()));
    };
    if xa.ask_xa(tx_id)? {
        frame::send_ok(stream)
    } else {
        frame::send_no(stream)
    }
}

fn handle_insert(ctx: &NodeContext, session: &Session, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let _schema = frame::read_str(stream)?;
    let _table = frame::read_str(stream)?;
    let req: InsertRequest = frame::read_obj(stream)?;

    let mut tx = ctx.transaction(tx_id);
    tx.set_isolation(session.isolation);
    match dml::executor::flush_insert(&ctx.executor(), &tx, &req) {
        Ok(()) => frame::send_ok(stream),
        Err(e) => {
            warn!(tx = tx_id, error = %e, "insert batch failed");
            frame::send_no(stream)
        }
    }
}

fn handle_delete(ctx: &NodeContext, session: &Session, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let _schema = frame::read_str(stream)?;
    let _table = frame::read_str(stream)?;
    let req: DeleteRequest = frame::read_obj(stream)?;

    let mut tx = ctx.transaction(tx_id);
    tx.set_isolation(session.isolation);
    match dml::executor::flush_delete(&ctx.executor(), &tx, &req) {
        Ok(()) => frame::send_ok(stream),
        Err(e) => {
            warn!(tx = tx_id, error = %e, "delete batch failed");
            frame::send_no(stream)
        }
    }
}

fn handle_update(ctx: &NodeContext, session: &Session, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let _schema = frame::read_str(stream)?;
    let _table = frame::read_str(stream)?;
    let req: UpdateRequest = frame::read_obj(stream)?;

    let mut tx = ctx.transaction(tx_id);
    tx.set_isolation(session.isolation);
    match dml::executor::flush_update(&ctx.executor(), &tx, &req) {
        Ok(()) => frame::send_ok(stream),
        Err(e) => {
            warn!(tx = tx_id, error = %e, "update batch failed");
            frame::send_no(stream)
        }
    }
}

/// Truncate: forward down the tree first, then run the local scan, then
/// report OK plus the subtree's total row count.
fn handle_mass_delete(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let _schema = frame::read_str(stream)?;
    let _table = frame::read_str(stream)?;
    let mut tree: Vec<TreeNode> = frame::read_obj(stream)?;
    let req: MassDeleteRequest = frame::read_obj(stream)?;

    peel_self(&mut tree);
    let child_rows = ctx.dispatch.mass_delete(tx_id, &req, tree);

    let tx = ctx.transaction(tx_id);
    match dml::executor::mass_delete(&ctx.executor(), &tx, &req) {
        Ok(outcome) => {
            frame::send_ok(stream)?;
            stream.write_u64::<BigEndian>(child_rows + outcome.rows)?;
            stream.flush()?;
            Ok(())
        }
        Err(e) => {
            warn!(tx = tx_id, error = %e, "mass delete failed");
            frame::send_no(stream)
        }
    }
}

/// Client COMMIT: run 2PC over the transaction's participant nodes. OK is
/// sent exactly once, after the outcome is durable.
fn handle_client_commit(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let nodes: Vec<i32> = frame::read_obj(stream)?;
    let Some(xa) = &ctx.xa else {
        return Err(GridError::Protocol("COMMIT sent to a non-coordinator".into()));
    };
    match xa.try_commit(tx_id, &nodes) {
        Ok(()) => frame::send_ok(stream),
        Err(GridError::Aborted(_)) => frame::send_no(stream),
        Err(e) => Err(e),
    }
}

fn handle_client_rollback(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let tx_id = frame::read_request_header(stream)?;
    let nodes: Vec<i32> = frame::read_obj(stream)?;
    let Some(xa) = &ctx.xa else {
        return Err(GridError::Protocol("ROLLBACK sent to a non-coordinator".into()));
    };
    xa.abort(tx_id, &nodes)?;
    frame::send_ok(stream)
}

/// Attach an additional log file at runtime. The log is recovered before OK
/// is sent, so by the time the caller proceeds the file accepts new records.
fn handle_add_log(ctx: &NodeContext, stream: &mut TcpStream) -> Result<()> {
    let _tx = frame::read_request_header(stream)?;
    let path = frame::read_str(stream)?;
    let report = ctx.add_log(std::path::Path::new(&path))?;
    debug!(%path, redone = report.redone, undone = report.undone, "attached log at runtime");
    frame::send_ok(stream)
}

fn handle_isolation(session: &mut Session, stream: &mut TcpStream) -> Result<()> {
    let _tx_id = frame::read_request_header(stream)?;
    let level = frame::read_bytes(stream)?;
    session.isolation = match level.first() {
        Some(0) | None => IsolationLevel::ReadCommitted,
        Some(1) => IsolationLevel::CursorStability,
        Some(other) => {
            return Err(GridError::Protocol(format!("unknown isolation level {other}")));
        }
    };
    frame::send_ok(stream)
}
