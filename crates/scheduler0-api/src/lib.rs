//! HTTP surface of Scheduler0.
//!
//! Client API (projects, jobs, credentials, executions), the peer API used
//! during fan-in, and the raft RPC endpoints, all served from one actix-web
//! application. Handlers translate [`scheduler0_commons::SchedulerError`]
//! into `{error, code}` bodies; follower writes answer 301 to the leader.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod state;

pub use routes::configure_routes;
pub use state::AppState;
