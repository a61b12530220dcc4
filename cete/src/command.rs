//! The command envelope applied through consensus: a closed sum over
//! `{Put, Delete, Join, Leave}`.

use async_raft::AppData;
use async_raft::AppDataResponse;
use async_raft::NodeId;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    Join {
        node_id: NodeId,
        bind_addr: String,
        grpc_addr: String,
        http_addr: String,
    },
    Leave {
        node_id: NodeId,
    },
}

impl AppData for Command {}

/// The result of applying a `Command` to the state machine. Every `Command`
/// variant mutates the store and has nothing further to report; reads are
/// served directly from the local `KvStore` without going through consensus
/// at all, so this type carries no data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommandResponse {
    Ok,
}

impl AppDataResponse for CommandResponse {}
