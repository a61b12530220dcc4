//! `cete` is a replicated key-value store: a thin coordination core wrapping
//! an embedded `sled` key-value engine in an `async-raft` state machine.
//!
//! See the [storage chapter of the async-raft guide](https://async-raft.github.io/async-raft/storage.html)
//! for the contract this crate's [`fsm::Store`] fulfills.

pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod kv;
pub mod log_store;
pub mod network;
pub mod peer;
pub mod rpc;
pub mod server;
pub mod snapshot;
pub mod stable_store;
pub mod types;

pub mod pb {
    tonic::include_proto!("cete");
}

pub use command::Command;
pub use command::CommandResponse;
pub use error::Error;
pub use server::RaftServer;
pub use types::NodeMetadata;
pub use types::NodeStateTag;

/// The concrete `async-raft` instantiation used throughout this crate.
pub type Raft = async_raft::Raft<Command, CommandResponse, network::GrpcNetwork, fsm::Store>;
