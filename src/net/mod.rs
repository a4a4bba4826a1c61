//! Cluster networking: RPC framing, spanning-tree broadcasts, the
//! blacklist/deferred-command queue, and the node server.

pub mod blacklist;
pub mod dispatch;
pub mod frame;
pub mod server;
pub mod tree;

pub use blacklist::{Blacklist, DeferredCommand, DeferredOp, RetrySender, RetryWorker};
pub use dispatch::Dispatcher;
pub use server::{NodeContext, Server};
pub use tree::TreeNode;
