//! C6: a lazily-populated pool of gRPC channels to the rest of the cluster.
//! Addresses come from `Command::Join` entries applied to the state machine
//! (via [`PeerPool::set_address`]); channels are opened on first use and
//! cached so repeated RPCs to the same peer reuse one connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_raft::NodeId;
use tokio::sync::RwLock;
use tonic::transport::Channel;
use tonic::transport::Endpoint;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
pub struct PeerPool {
    addresses: Arc<RwLock<HashMap<NodeId, String>>>,
    channels: Arc<RwLock<HashMap<NodeId, Channel>>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_address(&self, node_id: NodeId, grpc_addr: String) {
        let mut addresses = self.addresses.write().await;
        if addresses.get(&node_id) != Some(&grpc_addr) {
            addresses.insert(node_id, grpc_addr);
            drop(addresses);
            self.close(node_id).await;
        }
    }

    pub async fn channel(&self, node_id: NodeId) -> Result<Channel> {
        if let Some(channel) = self.channels.read().await.get(&node_id) {
            return Ok(channel.clone());
        }

        let addr = self
            .addresses
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or_else(|| anyhow!("no known address for node {}", node_id))?;

        let endpoint = format!("http://{}", addr);
        let channel = Endpoint::from_shared(endpoint)?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;

        self.channels.write().await.insert(node_id, channel.clone());
        Ok(channel)
    }

    pub async fn close(&self, node_id: NodeId) {
        self.channels.write().await.remove(&node_id);
    }

    pub async fn close_all(&self) {
        self.channels.write().await.clear();
    }
}
