//! C5: the facade a host process drives. Owns the `async-raft` handle, the
//! state machine, the peer pool, and the gRPC listener; translates between
//! them and the small, synchronous-feeling operation set described for
//! this crate's public surface (`Start`, `Stop`, `Get`/`Set`/`Delete`,
//! `Join`/`Leave`, `Node`/`Cluster`, `Snapshot`).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_raft::raft::ClientWriteRequest;
use async_raft::RaftStorage;
use tokio::sync::oneshot;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::config::NodeConfig;
use crate::consensus;
use crate::error::Error;
use crate::error::Result;
use crate::fsm::Store;
use crate::network::GrpcNetwork;
use crate::peer::PeerPool;
use crate::pb;
use crate::types::JoinOutcome;
use crate::types::JoinRequest;
use crate::types::NodeInfo;
use crate::types::NodeMetadata;
use crate::types::NodeStateTag;
use crate::Raft;

const APPLY_TIMEOUT: Duration = Duration::from_secs(10);
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RaftServer {
    node_id: u64,
    metadata: NodeMetadata,
    raft: Raft,
    store: Arc<Store>,
    peers: PeerPool,
    grpc_shutdown: Option<oneshot::Sender<()>>,
    grpc_task: Option<tokio::task::JoinHandle<()>>,
}

impl RaftServer {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.data_dir, config.node_id)?);
        let peers = PeerPool::new();

        for (id, meta) in store.list_metadata()? {
            if id != config.node_id {
                peers.set_address(id, meta.grpc_addr.clone()).await;
            }
        }

        let network = Arc::new(GrpcNetwork::new(peers.clone()));
        let raft_config = consensus::build_config(config.cluster_name())?;
        let raft = Raft::new(config.node_id, raft_config, network, store.clone());

        let metadata = NodeMetadata {
            bind_addr: config.bind_addr.clone(),
            grpc_addr: config.grpc_addr.clone(),
            http_addr: config.http_addr.clone(),
        };

        let grpc_addr = config
            .grpc_addr
            .parse()
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid grpc_addr {}: {}", config.grpc_addr, e)))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consensus_service =
            pb::consensus_rpc_server::ConsensusRpcServer::new(crate::rpc::ConsensusRpcService::new(raft.clone()));
        let node_info_service = pb::node_info_rpc_server::NodeInfoRpcServer::new(crate::rpc::NodeInfoRpcService::new(
            raft.clone(),
            metadata.clone(),
        ));
        let grpc_task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(consensus_service)
                .add_service(node_info_service)
                .serve_with_shutdown(grpc_addr, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("grpc server exited with error: {}", e);
            }
        });

        consensus::maybe_bootstrap(&raft, config.node_id, config.bootstrap).await?;

        Ok(Self {
            node_id: config.node_id,
            metadata,
            raft,
            store,
            peers,
            grpc_shutdown: Some(shutdown_tx),
            grpc_task: Some(grpc_task),
        })
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.raft.shutdown().await?;
        if let Some(tx) = self.grpc_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.grpc_task.take() {
            let _ = task.await;
        }
        self.peers.close_all().await;
        Ok(())
    }

    pub async fn state(&self) -> NodeStateTag {
        let state = self.raft.metrics().borrow().state;
        NodeStateTag::from(state)
    }

    /// Polls the consensus engine for the current leader at a 100 ms
    /// cadence, returning the advertised `bind_addr` of whichever node that
    /// is. Fails with `Timeout` if no leader is observed within `timeout`.
    pub async fn leader_address(&self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader_id) = self.raft.current_leader().await {
                let bind_addr = if leader_id == self.node_id {
                    self.metadata.bind_addr.clone()
                } else {
                    self.store.get_metadata(leader_id)?.ok_or(Error::LeaderNotFound)?.bind_addr
                };
                return Ok(bind_addr);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    /// Resolves `leader_address`, then maps that address back to a node id
    /// via the known metadata. Fails with `LeaderNotFound` if no known node
    /// advertises that address.
    pub async fn leader_id(&self, timeout: Duration) -> Result<u64> {
        let bind_addr = self.leader_address(timeout).await?;
        if bind_addr == self.metadata.bind_addr {
            return Ok(self.node_id);
        }
        for (id, meta) in self.store.list_metadata()? {
            if meta.bind_addr == bind_addr {
                return Ok(id);
            }
        }
        Err(Error::LeaderNotFound)
    }

    pub async fn exists(&self, node_id: u64) -> Result<bool> {
        Ok(self.current_voters().await?.contains(&node_id))
    }

    pub async fn join(&self, req: JoinRequest) -> Result<JoinOutcome> {
        let already_exists = self.exists(req.node_id).await?;

        self.peers.set_address(req.node_id, req.grpc_addr.clone()).await;

        if !already_exists {
            self.raft.add_non_voter(req.node_id).await.map_err(Error::from)?;
        }

        // A re-join still submits the metadata command, so a node whose
        // advertised addresses changed gets its metadata refreshed even
        // though it is already a voter.
        self.propose(Command::Join {
            node_id: req.node_id,
            bind_addr: req.bind_addr,
            grpc_addr: req.grpc_addr,
            http_addr: req.http_addr,
        })
        .await?;

        if already_exists {
            return Ok(JoinOutcome::AlreadyExists);
        }

        let mut members = self.current_voters().await?;
        members.insert(req.node_id);
        self.raft.change_membership(members).await.map_err(Error::from)?;

        Ok(JoinOutcome::Added)
    }

    pub async fn leave(&self, node_id: u64) -> Result<()> {
        if !self.exists(node_id).await? {
            tracing::info!(node_id, "leave requested for an id that is not a member, treating as a no-op");
            return Ok(());
        }

        self.propose(Command::Leave { node_id }).await?;

        let mut members = self.current_voters().await?;
        members.remove(&node_id);
        self.raft.change_membership(members).await.map_err(Error::from)?;
        self.peers.close(node_id).await;

        Ok(())
    }

    pub fn node(&self) -> NodeInfo {
        NodeInfo {
            bind_addr: self.metadata.bind_addr.clone(),
            grpc_addr: self.metadata.grpc_addr.clone(),
            http_addr: self.metadata.http_addr.clone(),
            state: self.raft.metrics().borrow().state.into(),
        }
    }

    pub async fn cluster(&self) -> Result<Vec<NodeInfo>> {
        let mut out = Vec::new();
        for id in self.current_voters().await? {
            if id == self.node_id {
                out.push(self.node());
                continue;
            }
            let known = self.store.get_metadata(id)?;
            out.push(self.query_peer(id, known).await);
        }
        Ok(out)
    }

    /// Asks a peer for its self-reported state over the `NodeInfo` RPC. A
    /// dial failure or RPC error is absorbed locally rather than aborting
    /// the whole `cluster()` call: the peer is reported as `Shutdown`,
    /// using whatever addresses this node already has on file for it.
    async fn query_peer(&self, id: u64, known: Option<NodeMetadata>) -> NodeInfo {
        let unreachable = |known: Option<NodeMetadata>| NodeInfo {
            bind_addr: known.as_ref().map(|m| m.bind_addr.clone()).unwrap_or_default(),
            grpc_addr: known.as_ref().map(|m| m.grpc_addr.clone()).unwrap_or_default(),
            http_addr: known.map(|m| m.http_addr).unwrap_or_default(),
            state: NodeStateTag::Shutdown,
        };

        let channel = match self.peers.channel(id).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(node_id = id, error = %e, "failed to dial peer for cluster query");
                return unreachable(known);
            }
        };

        let mut client = pb::node_info_rpc_client::NodeInfoRpcClient::new(channel);
        let resp = match client.get_node_info(pb::Empty {}).await {
            Ok(resp) => resp.into_inner(),
            Err(e) => {
                tracing::warn!(node_id = id, error = %e, "node-info rpc to peer failed");
                return unreachable(known);
            }
        };

        let state = match resp.state.as_str() {
            "Leader" => NodeStateTag::Leader,
            "Candidate" => NodeStateTag::Candidate,
            "Shutdown" => NodeStateTag::Shutdown,
            _ => NodeStateTag::Follower,
        };
        NodeInfo {
            bind_addr: resp.bind_addr,
            grpc_addr: resp.grpc_addr,
            http_addr: resp.http_addr,
            state,
        }
    }

    pub async fn snapshot(&self) -> Result<()> {
        RaftStorage::<Command, CommandResponse>::do_log_compaction(&*self.store).await?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.kv().get(key)
    }

    pub async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.propose(Command::Put { key, value }).await?;
        Ok(())
    }

    pub async fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.propose(Command::Delete { key }).await?;
        Ok(())
    }

    async fn current_voters(&self) -> Result<BTreeSet<u64>> {
        let membership = RaftStorage::<Command, CommandResponse>::get_membership_config(&*self.store).await?;
        Ok(membership.all_nodes())
    }

    async fn propose(&self, cmd: Command) -> Result<CommandResponse> {
        let req = ClientWriteRequest::new(cmd);
        let result = tokio::time::timeout(APPLY_TIMEOUT, self.raft.client_write(req))
            .await
            .map_err(|_| Error::ApplyTimeout)?;
        Ok(result.map_err(Error::from)?.data)
    }
}
