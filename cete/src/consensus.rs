//! C4: builds the `async-raft` engine's tuning and drives the bootstrap
//! policy described for `Start()` — a pristine node only forms a new
//! single-node cluster when explicitly told to; otherwise it waits to be
//! synced in by an existing leader's `Join`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_raft::config::SnapshotPolicy;
use async_raft::error::InitializeError;
use async_raft::Config;

use crate::error::Error;
use crate::error::Result;
use crate::Raft;

/// Number of log entries since the last snapshot before the next one is
/// triggered.
const SNAPSHOT_LOG_THRESHOLD: u64 = 1024;

pub fn build_config(cluster_name: String) -> Result<Arc<Config>> {
    let config = Config::build(cluster_name)
        .snapshot_policy(SnapshotPolicy::LogsSinceLast(SNAPSHOT_LOG_THRESHOLD))
        .validate()
        .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
    Ok(Arc::new(config))
}

/// Forms a new single-node cluster if `bootstrap` was requested and this
/// node's log is pristine. `InitializeError::NotAllowed` indicates the
/// cluster is already up and running, which is the desired end state
/// either way, so it is not treated as a failure.
pub async fn maybe_bootstrap(raft: &Raft, node_id: u64, bootstrap: bool) -> Result<()> {
    if !bootstrap {
        return Ok(());
    }
    let mut members = BTreeSet::new();
    members.insert(node_id);
    match raft.initialize(members).await {
        Ok(()) => Ok(()),
        Err(InitializeError::NotAllowed) => Ok(()),
        Err(InitializeError::RaftError(e)) => Err(e.into()),
    }
}
