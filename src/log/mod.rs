//! Write-ahead logging: LSN allocation, framed record files, the in-memory
//! tail with batched flush, bidirectional iteration, and ARIES-style
//! recovery.

pub mod iter;
pub mod lsn;
pub mod manager;
pub mod record;
pub mod recovery;
pub mod store;

pub use iter::{BackwardLogIterator, ForwardLogIterator};
pub use lsn::LsnAllocator;
pub use manager::LogManager;
pub use record::{LogData, LogRecord};
pub use recovery::{RecoveryEngine, RecoveryOutcomes, RecoveryReport};
pub use store::LogFile;

/// Log sequence number: strictly monotonic per process, clock-aligned.
pub type Lsn = u64;

/// Transaction id.
pub type TxId = u64;

pub const TX_NONE: TxId = 0;
