//! Typed HTTP client for the peer API.

use std::time::Duration;

use scheduler0_commons::models::AsyncTask;
use scheduler0_commons::{NodeId, SchedulerError};
use serde::{Deserialize, Serialize};

/// Body of `POST /peer/connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectRequest {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectResponse {
    pub is_auth: bool,
    pub is_alive: bool,
    pub is_leader: bool,
}

/// Response of `GET /peer/uncommitted-logs`: the async task to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncommittedLogsResponse {
    pub async_task_id: u64,
}

#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
    username: String,
    password: String,
}

impl PeerClient {
    pub fn new(username: String, password: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            username,
            password,
        }
    }

    fn base_url(address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        }
    }

    pub async fn connect(
        &self,
        peer_address: &str,
        node_id: NodeId,
        own_address: &str,
        timeout: Duration,
    ) -> Result<PeerConnectResponse, SchedulerError> {
        let url = format!("{}/peer/connect", Self::base_url(peer_address));
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .basic_auth(&self.username, Some(&self.password))
            .json(&PeerConnectRequest {
                node_id,
                address: own_address.to_string(),
            })
            .send()
            .await
            .map_err(|e| SchedulerError::unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SchedulerError::unavailable(format!(
                "peer {peer_address} answered {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Phase 1: ask the peer to collect its local data under `request_id`.
    pub async fn get_uncommitted_logs(
        &self,
        peer_address: &str,
        request_id: &str,
        timeout: Duration,
    ) -> Result<u64, SchedulerError> {
        let url = format!(
            "{}/peer/uncommitted-logs?requestId={request_id}",
            Self::base_url(peer_address)
        );
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| SchedulerError::unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SchedulerError::unavailable(format!(
                "peer {peer_address} answered {}",
                response.status()
            )));
        }
        let body: UncommittedLogsResponse = response
            .json()
            .await
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        Ok(body.async_task_id)
    }

    /// Phase 2: poll the peer's collection task.
    pub async fn get_async_task(
        &self,
        peer_address: &str,
        task_id: u64,
        timeout: Duration,
    ) -> Result<AsyncTask, SchedulerError> {
        let url = format!(
            "{}/peer/async-task/{task_id}",
            Self::base_url(peer_address)
        );
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| SchedulerError::unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SchedulerError::unavailable(format!(
                "peer {peer_address} answered {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalizes_schemes() {
        assert_eq!(
            PeerClient::base_url("http://10.0.0.1:9091/"),
            "http://10.0.0.1:9091"
        );
        assert_eq!(PeerClient::base_url("10.0.0.1:9091"), "http://10.0.0.1:9091");
    }
}
