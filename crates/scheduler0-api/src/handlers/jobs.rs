//! Job CRUD handlers.
//!
//! Single creates go straight through the repo; batch creates become a
//! durable async task (`batch_insert_jobs`) and the handler blocks on its
//! terminal transition, so a retried request with the same `x-request-id`
//! returns the same job ids.

use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use scheduler0_commons::constants::SERVICE_BATCH_INSERT_JOBS;
use scheduler0_commons::models::AsyncTaskState;
use scheduler0_commons::SchedulerError;
use scheduler0_core::repos::{JobDraft, JobUpdate};

use crate::auth::authenticate;
use crate::models::{
    error_response, CreateJobRequest, ListQuery, ListResponse, UpdateJobRequest,
};
use crate::state::AppState;

const BATCH_WAIT: Duration = Duration::from_secs(30);
pub const REQUEST_ID_HEADER: &str = "x-request-id";

impl From<CreateJobRequest> for JobDraft {
    fn from(body: CreateJobRequest) -> Self {
        JobDraft {
            project_id: body.project_id,
            spec: body.spec,
            timezone: body.timezone,
            callback_url: body.callback_url,
            data: body.data,
            start_date: body.start_date,
            end_date: body.end_date,
        }
    }
}

pub async fn create_one(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateJobRequest>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    match state.job_repo.create_one(body.into_inner().into()).await {
        Ok(job) => {
            // A grown job-id space can shift the allocation watermark.
            let coordinator = state.coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.trigger_allocation().await {
                    log::warn!("allocation after job create failed: {e}");
                }
            });
            HttpResponse::Created().json(job)
        }
        Err(e) => error_response(&e),
    }
}

pub async fn batch_create(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<Vec<CreateJobRequest>>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }
    if body.is_empty() {
        return error_response(&SchedulerError::validation("no jobs to insert"));
    }

    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let input = match serde_json::to_string(&body.into_inner().into_iter().map(JobDraftPayload::from).collect::<Vec<_>>()) {
        Ok(input) => input,
        Err(e) => return error_response(&SchedulerError::internal(e.to_string())),
    };

    let task_ids = match state
        .async_service
        .add_tasks(&input, &request_id, SERVICE_BATCH_INSERT_JOBS)
        .await
    {
        Ok(ids) => ids,
        Err(e) => return error_response(&e),
    };
    let Some(task_id) = task_ids.first().copied() else {
        return error_response(&SchedulerError::internal("task creation returned no id"));
    };

    let receiver = match state.async_service.get_task_blocking(task_id) {
        Ok(receiver) => receiver,
        Err(e) => return error_response(&e),
    };

    match tokio::time::timeout(BATCH_WAIT, receiver).await {
        Ok(Ok(task)) if task.state == AsyncTaskState::Success => {
            let job_ids: Vec<u64> = match serde_json::from_str(&task.output) {
                Ok(ids) => ids,
                Err(e) => return error_response(&SchedulerError::internal(e.to_string())),
            };
            match state.job_repo.batch_get_by_ids(&job_ids) {
                Ok(jobs) => HttpResponse::Created().json(jobs),
                Err(e) => error_response(&e),
            }
        }
        Ok(Ok(task)) => error_response(&SchedulerError::validation(task.output)),
        Ok(Err(_)) | Err(_) => error_response(&SchedulerError::unavailable(
            "timed out waiting for batch insert",
        )),
    }
}

/// Serialization shape of one batch entry on the async-task `input`.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDraftPayload {
    pub project_id: u64,
    pub spec: String,
    pub timezone: String,
    pub callback_url: String,
    pub data: String,
    pub start_date: Option<chrono::DateTime<chrono::Utc>>,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<CreateJobRequest> for JobDraftPayload {
    fn from(body: CreateJobRequest) -> Self {
        Self {
            project_id: body.project_id,
            spec: body.spec,
            timezone: body.timezone,
            callback_url: body.callback_url,
            data: body.data,
            start_date: body.start_date,
            end_date: body.end_date,
        }
    }
}

impl From<JobDraftPayload> for JobDraft {
    fn from(payload: JobDraftPayload) -> Self {
        JobDraft {
            project_id: payload.project_id,
            spec: payload.spec,
            timezone: payload.timezone,
            callback_url: payload.callback_url,
            data: payload.data,
            start_date: payload.start_date,
            end_date: payload.end_date,
        }
    }
}

pub async fn list(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    let Some(project_id) = query.project_id else {
        return error_response(&SchedulerError::validation("projectId is required"));
    };

    let (offset, limit) = (query.offset(), query.limit());
    let total = match state.job_repo.count_by_project_id(project_id) {
        Ok(total) => total,
        Err(e) => return error_response(&e),
    };
    match state
        .job_repo
        .get_all_by_project_id(project_id, offset, limit, "id")
    {
        Ok(jobs) => HttpResponse::Ok().json(ListResponse {
            total,
            offset,
            limit,
            data: jobs,
        }),
        Err(e) => error_response(&e),
    }
}

pub async fn get_one(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }

    match state.job_repo.get_one_by_id(path.into_inner()) {
        Ok(Some(job)) => HttpResponse::Ok().json(job),
        Ok(None) => error_response(&SchedulerError::not_found("job does not exist")),
        Err(e) => error_response(&e),
    }
}

pub async fn update_one(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
    body: web::Json<UpdateJobRequest>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    let body = body.into_inner();
    let update = JobUpdate {
        spec: body.spec,
        timezone: body.timezone,
        project_id: body.project_id,
        callback_url: body.callback_url,
        data: body.data,
        start_date: body.start_date,
        end_date: body.end_date,
    };
    match state
        .job_repo
        .update_one_by_id(path.into_inner(), update)
        .await
    {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_one(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    match state.job_repo.delete_one_by_id(path.into_inner()).await {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}
