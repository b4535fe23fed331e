//! Raft networking over the cluster's HTTP plane.
//!
//! Replication RPCs are JSON POSTs against the peer's HTTP server
//! (`/raft/vote`, `/raft/append`, `/raft/snapshot`). The response body is the
//! remote node's `Result`, so a remote raft error deserializes intact and is
//! surfaced as `RPCError::RemoteError`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RemoteError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{Node, NodeId, TypeConfig};

/// URL paths the raft RPC endpoints are served on.
pub struct RaftRequestPath;

impl RaftRequestPath {
    pub const VOTE: &'static str = "/raft/vote";
    pub const APPEND: &'static str = "/raft/append";
    pub const SNAPSHOT: &'static str = "/raft/snapshot";
}

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const SNAPSHOT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Factory shared by the raft core; also the peer address registry.
#[derive(Clone)]
pub struct HttpRaftNetwork {
    peers: Arc<DashMap<NodeId, Node>>,
    client: reqwest::Client,
}

impl Default for HttpRaftNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRaftNetwork {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    pub fn register_node(&self, node_id: NodeId, node: Node) {
        self.peers.insert(node_id, node);
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<Node> {
        self.peers.get(&node_id).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for HttpRaftNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRaftNetwork")
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpRaftNetwork {
    type Network = HttpRaftConnection;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        HttpRaftConnection {
            target,
            node: node.clone(),
            client: self.client.clone(),
        }
    }
}

/// A connection to one peer. Stateless besides the resolved address.
pub struct HttpRaftConnection {
    target: NodeId,
    node: Node,
    client: reqwest::Client,
}

impl HttpRaftConnection {
    async fn send<Req, Resp, Err>(
        &self,
        path: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Resp, RPCError<NodeId, Node, Err>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        Err: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}{}", self.node.raft_address, path);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let result: Result<Resp, Err> = response
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpRaftConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<NodeId>,
        RPCError<NodeId, Node, openraft::error::RaftError<NodeId>>,
    > {
        self.send(RaftRequestPath::APPEND, &rpc, RPC_TIMEOUT).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, openraft::error::RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send(RaftRequestPath::SNAPSHOT, &rpc, SNAPSHOT_RPC_TIMEOUT)
            .await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, openraft::error::RaftError<NodeId>>>
    {
        self.send(RaftRequestPath::VOTE, &rpc, RPC_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_stores_and_returns_nodes() {
        let network = HttpRaftNetwork::new();
        assert!(network.get_node(1).is_none());

        let node = Node {
            raft_address: "127.0.0.1:7071".into(),
            http_address: "http://127.0.0.1:9091".into(),
        };
        network.register_node(1, node.clone());
        assert_eq!(network.get_node(1), Some(node));
    }
}
