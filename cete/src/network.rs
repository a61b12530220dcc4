//! The client side of the consensus wire protocol: turns `async-raft`'s
//! outbound RPC calls into gRPC requests against a peer's `ConsensusRpc`
//! service. Bodies travel as opaque `serde_json` bytes inside `Envelope`
//! (see `proto/cete.proto`), so this module never needs to know the shape
//! of the request/response types beyond `Serialize`/`Deserialize`.

use anyhow::anyhow;
use anyhow::Result;
use async_raft::raft::AppendEntriesRequest;
use async_raft::raft::AppendEntriesResponse;
use async_raft::raft::InstallSnapshotRequest;
use async_raft::raft::InstallSnapshotResponse;
use async_raft::raft::VoteRequest;
use async_raft::raft::VoteResponse;
use async_raft::NodeId;
use async_raft::RaftNetwork;
use async_trait::async_trait;

use crate::command::Command;
use crate::pb::consensus_rpc_client::ConsensusRpcClient;
use crate::pb::Envelope;
use crate::peer::PeerPool;

pub struct GrpcNetwork {
    peers: PeerPool,
}

impl GrpcNetwork {
    pub fn new(peers: PeerPool) -> Self {
        Self { peers }
    }

    async fn client(&self, target: NodeId) -> Result<ConsensusRpcClient<tonic::transport::Channel>> {
        let channel = self.peers.channel(target).await?;
        Ok(ConsensusRpcClient::new(channel))
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Envelope> {
        Ok(Envelope {
            payload: serde_json::to_vec(value)?,
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(envelope: Envelope) -> Result<T> {
        Ok(serde_json::from_slice(&envelope.payload)?)
    }
}

#[async_trait]
impl RaftNetwork<Command> for GrpcNetwork {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<Command>,
    ) -> Result<AppendEntriesResponse> {
        let mut client = self.client(target).await?;
        let req = tonic::Request::new(Self::encode(&rpc)?);
        let resp = client
            .append_entries(req)
            .await
            .map_err(|e| anyhow!("append_entries rpc to node {} failed: {}", target, e))?;
        Self::decode(resp.into_inner())
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut client = self.client(target).await?;
        let req = tonic::Request::new(Self::encode(&rpc)?);
        let resp = client
            .install_snapshot(req)
            .await
            .map_err(|e| anyhow!("install_snapshot rpc to node {} failed: {}", target, e))?;
        Self::decode(resp.into_inner())
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let mut client = self.client(target).await?;
        let req = tonic::Request::new(Self::encode(&rpc)?);
        let resp = client
            .vote(req)
            .await
            .map_err(|e| anyhow!("vote rpc to node {} failed: {}", target, e))?;
        Self::decode(resp.into_inner())
    }
}
