//! Request/response DTOs and error translation.

use actix_web::http::{header, StatusCode};
use actix_web::HttpResponse;
use chrono::{DateTime, Utc};
use scheduler0_commons::SchedulerError;
use serde::{Deserialize, Serialize};

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

/// Render a domain error; `NotLeader` becomes a 301 with the leader address
/// in `Location`.
pub fn error_response(err: &SchedulerError) -> HttpResponse {
    let code = err.status_code();
    let body = ErrorBody {
        error: err.to_string(),
        code,
    };
    match err {
        SchedulerError::NotLeader { leader_address } => {
            let mut builder = HttpResponse::MovedPermanently();
            if let Some(address) = leader_address {
                builder.insert_header((header::LOCATION, address.clone()));
            }
            builder.json(body)
        }
        _ => HttpResponse::build(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .json(body),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub project_id: u64,
    #[serde(default)]
    pub spec: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub callback_url: String,
    #[serde(default)]
    pub data: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    pub spec: Option<String>,
    pub timezone: Option<String>,
    pub project_id: Option<u64>,
    pub callback_url: Option<String>,
    pub data: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCredentialRequest {
    pub archived: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub project_id: Option<u64>,
    pub job_id: Option<u64>,
}

impl ListQuery {
    pub fn offset(&self) -> u64 {
        self.offset.unwrap_or(0)
    }

    pub fn limit(&self) -> u64 {
        self.limit.unwrap_or(50).min(500)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncommittedLogsQuery {
    pub request_id: String,
}
