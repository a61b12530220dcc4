//! Process-level configuration: where state lives on disk, how this node
//! is addressed, and whether it should form a brand-new cluster on first
//! start. Parsed from the CLI with `structopt`.

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "cete-node", about = "A small replicated key-value node.")]
pub struct NodeConfig {
    /// This node's Raft id. Must be stable across restarts of the same node.
    #[structopt(long)]
    pub node_id: u64,

    /// Root directory for this node's persistent state.
    #[structopt(long, parse(from_os_str))]
    pub data_dir: PathBuf,

    /// Address the consensus transport advertises to peers (`host:port`).
    #[structopt(long)]
    pub bind_addr: String,

    /// Address this node's gRPC server listens on.
    #[structopt(long)]
    pub grpc_addr: String,

    /// Address this node's HTTP surface listens on (outer service tier).
    #[structopt(long)]
    pub http_addr: String,

    /// When set, and this node's log is pristine, form a new single-node
    /// cluster instead of waiting to be joined by an existing one.
    #[structopt(long)]
    pub bootstrap: bool,
}

impl NodeConfig {
    pub fn cluster_name(&self) -> String {
        "cete".to_string()
    }
}
