//! Embedded data store for Scheduler0.
//!
//! One SQLite database per node behind a single process-wide connection lock.
//! The Raft state machine applies committed commands here, and the snapshot
//! codec serializes the whole database for Raft snapshot transfer.

pub mod data_store;
pub mod migrations;
pub mod shared_repo;
pub mod snapshot;

pub use data_store::{SqliteStore, StoreError};
pub use shared_repo::SharedRepo;
