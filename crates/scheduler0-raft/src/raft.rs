//! Raft instance construction and cluster bootstrap.

use std::collections::BTreeMap;
use std::sync::Arc;

use openraft::error::InitializeError;
use openraft::{Config, SnapshotPolicy};

use crate::error::RaftError;
use crate::network::HttpRaftNetwork;
use crate::storage::SchedulerRaftStorage;
use crate::types::{Node, NodeId, Raft, TypeConfig};

/// Tunables for the raft core; defaults fit both single-node and small
/// clusters.
#[derive(Debug, Clone)]
pub struct RaftConfigOptions {
    pub cluster_name: String,
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    pub snapshot_logs_since_last: u64,
}

impl Default for RaftConfigOptions {
    fn default() -> Self {
        Self {
            cluster_name: "scheduler0".to_string(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            snapshot_logs_since_last: 1000,
        }
    }
}

/// Create and start the raft instance over the combined storage.
pub async fn start_raft(
    node_id: NodeId,
    options: RaftConfigOptions,
    network: HttpRaftNetwork,
    storage: Arc<SchedulerRaftStorage>,
) -> Result<Raft, RaftError> {
    let config = Config {
        cluster_name: options.cluster_name,
        election_timeout_min: options.election_timeout_min,
        election_timeout_max: options.election_timeout_max,
        heartbeat_interval: options.heartbeat_interval,
        snapshot_policy: SnapshotPolicy::LogsSinceLast(options.snapshot_logs_since_last),
        ..Default::default()
    };
    let config = Arc::new(
        config
            .validate()
            .map_err(|e| RaftError::Internal(e.to_string()))?,
    );

    let (log_store, state_machine): (
        openraft::storage::Adaptor<TypeConfig, Arc<SchedulerRaftStorage>>,
        openraft::storage::Adaptor<TypeConfig, Arc<SchedulerRaftStorage>>,
    ) = openraft::storage::Adaptor::new(storage);

    let raft = openraft::Raft::new(node_id, config, network, log_store, state_machine)
        .await
        .map_err(|e| RaftError::Internal(format!("failed to create raft: {e:?}")))?;

    Ok(raft)
}

/// Initialize the cluster membership on the bootstrap node. A cluster that is
/// already initialized is left untouched.
pub async fn bootstrap_cluster(
    raft: &Raft,
    members: BTreeMap<NodeId, Node>,
) -> Result<(), RaftError> {
    match raft.initialize(members).await {
        Ok(()) => Ok(()),
        Err(openraft::error::RaftError::APIError(InitializeError::NotAllowed(_))) => {
            log::debug!("cluster already initialized; skipping bootstrap");
            Ok(())
        }
        Err(e) => Err(RaftError::Internal(format!(
            "cluster initialization failed: {e:?}"
        ))),
    }
}
