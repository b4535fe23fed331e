//! Openraft type configuration for the Scheduler0 cluster.

use std::io::Cursor;

use openraft::RaftTypeConfig;
use serde::{Deserialize, Serialize};

pub type NodeId = u64;

/// Node addresses carried in the Raft membership config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Node {
    /// Address the raft RPC endpoints are reachable on (host:port).
    pub raft_address: String,
    /// Client-facing HTTP address, used for leader redirects and fan-in.
    pub http_address: String,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.raft_address, self.http_address)
    }
}

/// Log entries and responses are bincode-serialized commands; snapshots carry
/// the framed SQLite database.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd)]
#[derive(Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = Vec<u8>;
    type R = Vec<u8>;
    type NodeId = NodeId;
    type Node = Node;
    type Entry = openraft::Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

pub type Raft = openraft::Raft<TypeConfig>;
