//! The server side of the wire protocol: dispatches incoming gRPC calls to
//! the local [`Raft`](crate::Raft) handle, and answers peer introspection
//! queries used by `Cluster()`.

use tonic::Request;
use tonic::Response;
use tonic::Status;

use crate::pb;
use crate::types::NodeInfo;
use crate::types::NodeMetadata;
use crate::types::NodeStateTag;
use crate::Raft;

fn decode<T: serde::de::DeserializeOwned>(envelope: pb::Envelope) -> Result<T, Status> {
    serde_json::from_slice(&envelope.payload).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<pb::Envelope, Status> {
    let payload = serde_json::to_vec(value).map_err(|e| Status::internal(e.to_string()))?;
    Ok(pb::Envelope { payload })
}

pub struct ConsensusRpcService {
    raft: Raft,
}

impl ConsensusRpcService {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl pb::consensus_rpc_server::ConsensusRpc for ConsensusRpcService {
    async fn append_entries(&self, request: Request<pb::Envelope>) -> Result<Response<pb::Envelope>, Status> {
        let rpc = decode(request.into_inner())?;
        let resp = self
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(encode(&resp)?))
    }

    async fn vote(&self, request: Request<pb::Envelope>) -> Result<Response<pb::Envelope>, Status> {
        let rpc = decode(request.into_inner())?;
        let resp = self.raft.vote(rpc).await.map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(encode(&resp)?))
    }

    async fn install_snapshot(&self, request: Request<pb::Envelope>) -> Result<Response<pb::Envelope>, Status> {
        let rpc = decode(request.into_inner())?;
        let resp = self
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(encode(&resp)?))
    }
}

pub struct NodeInfoRpcService {
    raft: Raft,
    metadata: NodeMetadata,
}

impl NodeInfoRpcService {
    pub fn new(raft: Raft, metadata: NodeMetadata) -> Self {
        Self { raft, metadata }
    }
}

#[tonic::async_trait]
impl pb::node_info_rpc_server::NodeInfoRpc for NodeInfoRpcService {
    async fn get_node_info(&self, _request: Request<pb::Empty>) -> Result<Response<pb::NodeInfo>, Status> {
        let metrics = self.raft.metrics().borrow().clone();
        let info = NodeInfo {
            bind_addr: self.metadata.bind_addr.clone(),
            grpc_addr: self.metadata.grpc_addr.clone(),
            http_addr: self.metadata.http_addr.clone(),
            state: NodeStateTag::from(metrics.state),
        };
        Ok(Response::new(pb::NodeInfo {
            bind_addr: info.bind_addr,
            grpc_addr: info.grpc_addr,
            http_addr: info.http_addr,
            state: info.state.to_string(),
        }))
    }
}
