//! Environment-driven configuration.

use anyhow::{anyhow, Result};
use scheduler0_commons::constants::*;
use scheduler0_commons::models::Replica;
use scheduler0_commons::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheduler0Config {
    pub node_id: NodeId,
    pub port: u16,
    /// Address the raft RPC endpoints are served and advertised on.
    pub raft_address: String,
    /// Every node in the cluster, this one included.
    pub replicas: Vec<Replica>,
    /// Initialize cluster membership on first boot.
    pub bootstrap: bool,
    /// Fan-in concurrency (`F`).
    pub fan_in: usize,
    /// Fan-in sweep interval.
    pub fetch_interval_seconds: u64,
    pub sqlite_file_path: String,
    pub log_level: String,
    pub log_file_path: String,
    /// Callback timeout (`T_cb`).
    pub execution_timeout_seconds: u64,
    /// Callback attempts (`K`).
    pub execution_retry_max: u64,
    /// Executor queue depth (`Q`).
    pub job_queue_depth: usize,
    /// Executor worker pool size (`W`).
    pub executor_workers: usize,
    /// In-progress async-task cap (`A`).
    pub async_task_concurrency: usize,
    /// Fan-in attempt deadline (`T_fi`).
    pub fan_in_timeout_seconds: u64,
    /// Cancellation drain (`T_drain`).
    pub shutdown_drain_seconds: u64,
    pub auth_username: String,
    pub auth_password: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid value for {key}: {value:?}")),
        Err(_) => Ok(default),
    }
}

impl Default for Scheduler0Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            port: 9091,
            raft_address: "127.0.0.1:7071".to_string(),
            replicas: Vec::new(),
            bootstrap: false,
            fan_in: 2,
            fetch_interval_seconds: 2,
            sqlite_file_path: "scheduler0.db".to_string(),
            log_level: "info".to_string(),
            log_file_path: "logs/scheduler0.log".to_string(),
            execution_timeout_seconds: 30,
            execution_retry_max: 3,
            job_queue_depth: 1024,
            executor_workers: 4,
            async_task_concurrency: num_cpus::get(),
            fan_in_timeout_seconds: 10,
            shutdown_drain_seconds: 5,
            auth_username: "admin".to_string(),
            auth_password: "admin".to_string(),
        }
    }
}

impl Scheduler0Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let replicas = match std::env::var(ENV_REPLICAS) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| anyhow!("invalid {ENV_REPLICAS} json: {e}"))?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            node_id: env_or(ENV_NODE_ID, defaults.node_id)?,
            port: env_or(ENV_PORT, defaults.port)?,
            raft_address: env_or(ENV_RAFT_ADDRESS, defaults.raft_address)?,
            replicas,
            bootstrap: env_or(ENV_BOOTSTRAP, defaults.bootstrap)?,
            fan_in: env_or(ENV_FAN_IN, defaults.fan_in)?,
            fetch_interval_seconds: env_or(ENV_FETCH_INTERVAL, defaults.fetch_interval_seconds)?,
            sqlite_file_path: env_or(ENV_SQLITE_FILE_PATH, defaults.sqlite_file_path)?,
            log_level: env_or(ENV_LOG_LEVEL, defaults.log_level)?,
            log_file_path: env_or(ENV_LOG_FILE_PATH, defaults.log_file_path)?,
            execution_timeout_seconds: env_or(
                ENV_EXECUTION_TIMEOUT,
                defaults.execution_timeout_seconds,
            )?,
            execution_retry_max: env_or(ENV_EXECUTION_RETRY_MAX, defaults.execution_retry_max)?,
            job_queue_depth: env_or(ENV_JOB_QUEUE_DEPTH, defaults.job_queue_depth)?,
            executor_workers: env_or(ENV_EXECUTOR_WORKERS, defaults.executor_workers)?,
            async_task_concurrency: env_or(
                ENV_ASYNC_TASK_CONCURRENCY,
                defaults.async_task_concurrency,
            )?,
            fan_in_timeout_seconds: env_or(ENV_FAN_IN_TIMEOUT, defaults.fan_in_timeout_seconds)?,
            shutdown_drain_seconds: env_or(ENV_SHUTDOWN_DRAIN, defaults.shutdown_drain_seconds)?,
            auth_username: env_or(ENV_AUTH_USERNAME, defaults.auth_username)?,
            auth_password: env_or(ENV_AUTH_PASSWORD, defaults.auth_password)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("server port cannot be 0"));
        }
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level {:?}; must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.executor_workers == 0 {
            return Err(anyhow!("executor workers cannot be 0"));
        }
        if self.job_queue_depth == 0 {
            return Err(anyhow!("job queue depth cannot be 0"));
        }
        if self.execution_retry_max == 0 {
            return Err(anyhow!("execution retry max cannot be 0"));
        }
        if !self.replicas.is_empty()
            && !self.replicas.iter().any(|r| r.node_id == self.node_id)
        {
            return Err(anyhow!(
                "replicas do not include this node (id {})",
                self.node_id
            ));
        }
        Ok(())
    }

    /// This node's client-facing address, advertised to peers and used in
    /// leader redirects.
    pub fn own_address(&self) -> String {
        self.replicas
            .iter()
            .find(|r| r.node_id == self.node_id)
            .map(|r| r.address.clone())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }

    pub fn is_single_node(&self) -> bool {
        self.replicas.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Scheduler0Config::default().validate().is_ok());
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut config = Scheduler0Config::default();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut config = Scheduler0Config::default();
        config.log_level = "noisy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn replicas_must_include_self() {
        let mut config = Scheduler0Config::default();
        config.node_id = 3;
        config.replicas = vec![Replica {
            node_id: 1,
            raft_address: "127.0.0.1:7071".into(),
            address: "http://127.0.0.1:9091".into(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn own_address_falls_back_to_port() {
        let config = Scheduler0Config::default();
        assert_eq!(config.own_address(), "http://127.0.0.1:9091");
    }
}
