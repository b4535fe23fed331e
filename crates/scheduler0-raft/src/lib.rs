//! Raft consensus layer for Scheduler0.
//!
//! A single Raft group replicates every write as a serialized [`Command`].
//! The state machine applies committed entries to the SQLite store, snapshots
//! carry the serialized database, and inter-node RPCs ride the same HTTP
//! plane as the peer API.

pub mod actions;
pub mod command;
pub mod error;
pub mod fsm;
pub mod network;
pub mod raft;
pub mod storage;
pub mod types;

pub use actions::RaftActions;
pub use command::{decode, encode, AsyncTaskCommand, Command, CommandResponse, SqlValue};
pub use error::{RaftError, Result};
pub use fsm::{FsmEvent, SchedulerFsm};
pub use network::{HttpRaftNetwork, RaftRequestPath};
pub use raft::{bootstrap_cluster, start_raft, RaftConfigOptions};
pub use storage::SchedulerRaftStorage;
pub use types::{Node, NodeId, Raft, TypeConfig};
