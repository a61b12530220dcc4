//! Shared data-model types: node identity, advertised addresses, and the
//! externally observable node/cluster description.

use async_raft::NodeId;
use async_raft::State;
use serde::Deserialize;
use serde::Serialize;

/// The advertised endpoints of a cluster member.
///
/// `bind_addr` is the consensus transport endpoint (also the `async-raft`
/// replication target); `grpc_addr` and `http_addr` are advertised for the
/// outer service tiers and are never dialed by the consensus layer itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub bind_addr: String,
    pub grpc_addr: String,
    pub http_addr: String,
}

/// Mirrors `async_raft::State`, adding the terminal `Shutdown` tag that
/// `async-raft` itself does not model (a stopped `RaftServer` has no
/// `async_raft::State` to report).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStateTag {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl From<State> for NodeStateTag {
    fn from(s: State) -> Self {
        match s {
            State::Follower => NodeStateTag::Follower,
            State::Candidate => NodeStateTag::Candidate,
            State::Leader => NodeStateTag::Leader,
            // Non-voters never appear in this single-voter core's public surface,
            // but are reported as followers rather than panicking on an
            // unreachable arm.
            State::NonVoter => NodeStateTag::Follower,
            State::Shutdown => NodeStateTag::Shutdown,
        }
    }
}

impl std::fmt::Display for NodeStateTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStateTag::Follower => "Follower",
            NodeStateTag::Candidate => "Candidate",
            NodeStateTag::Leader => "Leader",
            NodeStateTag::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// The local node's self-description, as returned by `RaftServer::node`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub bind_addr: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub state: NodeStateTag,
}

/// The outcome of a `Join` call. A re-join of an already-known node id is
/// not an error: it resolves to `AlreadyExists` rather than `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Added,
    AlreadyExists,
}

/// A request to join the cluster, carrying the full advertised address set.
#[derive(Clone, Debug)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub bind_addr: String,
    pub grpc_addr: String,
    pub http_addr: String,
}
