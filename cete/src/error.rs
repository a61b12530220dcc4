//! The domain error type, one variant per disposition in the error-handling
//! design: each variant is either surfaced to the caller unchanged or is
//! fatal (logged and propagated, never swallowed).

use async_raft::error::ChangeConfigError;
use async_raft::error::ClientReadError;
use async_raft::error::ClientWriteError;
use async_raft::error::InitializeError;
use async_raft::error::RaftError;
use async_raft::error::ResponseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("node is not the cluster leader")]
    NotLeader,

    #[error("apply did not complete within the timeout; it may still commit")]
    ApplyTimeout,

    #[error("timed out waiting for a condition")]
    Timeout,

    #[error("leader address is not present in the current configuration")]
    LeaderNotFound,

    #[error("key not found")]
    NotFound,

    #[error("operation attempted after the node was stopped")]
    Closed,

    #[error("log entry carried an unrecognized command variant")]
    UnknownCommand,

    #[error("storage engine I/O error: {0}")]
    StorageIo(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("raft is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl<D: async_raft::AppData> From<ClientWriteError<D>> for Error {
    fn from(e: ClientWriteError<D>) -> Self {
        match e {
            ClientWriteError::RaftError(re) => re.into(),
            // Any non-RaftError variant indicates the write was rejected
            // because this node is not (or is no longer) the leader.
            _ => Error::NotLeader,
        }
    }
}

impl From<ChangeConfigError> for Error {
    fn from(e: ChangeConfigError) -> Self {
        Error::Other(anyhow::anyhow!(e.to_string()))
    }
}

impl From<InitializeError> for Error {
    fn from(e: InitializeError) -> Self {
        Error::Other(anyhow::anyhow!(e.to_string()))
    }
}

impl From<ResponseError> for Error {
    fn from(e: ResponseError) -> Self {
        Error::Other(anyhow::anyhow!(e.to_string()))
    }
}

impl From<ClientReadError> for Error {
    fn from(e: ClientReadError) -> Self {
        Error::Other(anyhow::anyhow!(e.to_string()))
    }
}

impl From<RaftError> for Error {
    fn from(e: RaftError) -> Self {
        match e {
            RaftError::ShuttingDown => Error::ShuttingDown,
            other => Error::Other(anyhow::anyhow!(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
