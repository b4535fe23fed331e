//! Execution-history handler.

use actix_web::{web, HttpRequest, HttpResponse};
use scheduler0_commons::SchedulerError;

use crate::auth::authenticate;
use crate::models::{error_response, ListQuery, ListResponse};
use crate::state::AppState;

pub async fn list(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    let Some(job_id) = query.job_id else {
        return error_response(&SchedulerError::validation("jobId is required"));
    };

    let (offset, limit) = (query.offset(), query.limit());
    let total = match state.executions_repo.count_by_job_id(job_id) {
        Ok(total) => total,
        Err(e) => return error_response(&e),
    };
    match state.executions_repo.list_by_job_id(job_id, offset, limit) {
        Ok(executions) => HttpResponse::Ok().json(ListResponse {
            total,
            offset,
            limit,
            data: executions,
        }),
        Err(e) => error_response(&e),
    }
}
