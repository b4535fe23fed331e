//! Scheduler0 server entrypoint.
//!
//! The heavy lifting (initialization, raft wiring, graceful shutdown) lives
//! in dedicated modules so this file remains a thin orchestrator.

use anyhow::Result;
use log::info;
use scheduler0::config::Scheduler0Config;
use scheduler0::lifecycle::{bootstrap, run};
use scheduler0::logging;

#[actix_web::main]
async fn main() -> Result<()> {
    let config = Scheduler0Config::from_env()?;

    // Logging before any other side effects.
    logging::init_logging(&config.log_level, &config.log_file_path, true)?;

    info!(
        "scheduler0 v{} starting: node {} on port {} (raft at {})",
        env!("CARGO_PKG_VERSION"),
        config.node_id,
        config.port,
        config.raft_address
    );

    let components = bootstrap(&config).await?;
    run(&config, components).await
}
