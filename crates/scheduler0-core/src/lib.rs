//! Scheduling core of Scheduler0.
//!
//! Domain repositories write through the Raft actions layer and read the
//! SQLite store directly; the allocator partitions the job-id space on the
//! leader; each node's processor and executor fire the callbacks for its
//! assigned range; the async-task engine makes client writes durable; and the
//! node coordinator ties leadership transitions, fan-in, and shutdown
//! together.

pub mod allocator;
pub mod async_tasks;
pub mod executor;
pub mod node;
pub mod peer_client;
pub mod processor;
pub mod repos;
pub mod schedule;

pub use allocator::JobQueueAllocator;
pub use async_tasks::{AsyncTaskHandler, AsyncTaskService, HandlerFuture};
pub use executor::{ExecutionMode, ExecutorConfig, ExecutorHandle, FireEvent, JobExecutor};
pub use node::{NodeCoordinator, NodeCoordinatorConfig};
pub use peer_client::PeerClient;
pub use processor::JobProcessor;
