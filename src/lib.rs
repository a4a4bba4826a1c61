mod core;
pub mod dml;
pub mod log;
pub mod meta;
pub mod net;
pub mod tx;
pub mod xa;

pub use crate::core::config::NodeConfig;
pub use crate::core::errors::{GridError, Result, StorageError};
pub use crate::dml::{
    DeleteRequest, InsertRequest, MassDeleteRequest, RidAndKeys, UpdateRequest, UpdateRow,
};
pub use crate::log::{
    BackwardLogIterator, ForwardLogIterator, LogData, LogManager, LogRecord, Lsn, LsnAllocator,
    RecoveryEngine, RecoveryOutcomes, RecoveryReport, TxId,
};
pub use crate::meta::{
    Block, Catalog, ColDef, ColType, ColValue, IndexDef, IndexFactory, PageStore, PartitionMeta,
    ResultStreamer, Rid, RidChange, RowPage, SecondaryIndex, TableSchema,
};
pub use crate::net::{Blacklist, Dispatcher, NodeContext, RetryWorker, Server, TreeNode};
pub use crate::tx::{IsolationLevel, Transaction};
pub use crate::xa::{ClusterOutcomes, XaManager};
