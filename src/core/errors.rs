use thiserror::Error;

use crate::log::TxId;

/// Top-level error taxonomy for the transactional core.
///
/// Fatal durability failures poison the owning subsystem; transient network
/// failures are converted into NO votes or deferred retries by the callers
/// that observe them. Protocol violations are reported to the peer and the
/// socket is closed without transactional effect.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("fatal durability failure: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Net(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("index error: {0}")]
    Index(String),

    #[error("application error: {0}")]
    App(String),

    #[error("transaction {0} aborted")]
    Aborted(TxId),

    #[error("transaction {0} is in doubt and the coordinator is unreachable")]
    InDoubt(TxId),

    #[error("log manager terminated after a flush failure")]
    LogDead,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

pub type Result<T> = std::result::Result<T, GridError>;

impl GridError {
    /// Transient failures may be retried through the deferred-command queue;
    /// everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, GridError::Net(_) | GridError::Io(_))
    }
}
