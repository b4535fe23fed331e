//! Project CRUD handlers.

use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth::authenticate;
use crate::models::{
    error_response, CreateProjectRequest, ListQuery, ListResponse, UpdateProjectRequest,
};
use crate::state::AppState;

pub async fn create(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateProjectRequest>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    match state
        .project_repo
        .create_one(&body.name, &body.description)
        .await
    {
        Ok(project) => HttpResponse::Created().json(project),
        Err(e) => error_response(&e),
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

    let (offset, limit) = (query.offset(), query.limit());
    let total = match state.project_repo.count() {
        Ok(total) => total,
        Err(e) => return error_response(&e),
    };
    match state.project_repo.list(offset, limit) {
        Ok(projects) => HttpResponse::Ok().json(ListResponse {
            total,
            offset,
            limit,
            data: projects,
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

    match state.project_repo.get_one_by_id(path.into_inner()) {
        Ok(Some(project)) => HttpResponse::Ok().json(project),
        Ok(None) => error_response(&scheduler0_commons::SchedulerError::not_found(
            "project does not exist",
        )),
        Err(e) => error_response(&e),
    }
}

pub async fn update_one(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
    body: web::Json<UpdateProjectRequest>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    match state
        .project_repo
        .update_one_by_id(path.into_inner(), &body.description)
        .await
    {
        Ok(project) => HttpResponse::Ok().json(project),
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

    match state.project_repo.delete_one_by_id(path.into_inner()).await {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}
