//! Credential CRUD handlers.

use actix_web::{web, HttpRequest, HttpResponse};
use scheduler0_commons::SchedulerError;

use crate::auth::authenticate;
use crate::models::{error_response, ListQuery, ListResponse, UpdateCredentialRequest};
use crate::state::AppState;

pub async fn create(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    match state.credential_repo.create_one().await {
        Ok(credential) => HttpResponse::Created().json(credential),
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
    let total = match state.credential_repo.count() {
        Ok(total) => total,
        Err(e) => return error_response(&e),
    };
    match state.credential_repo.list(offset, limit) {
        Ok(credentials) => HttpResponse::Ok().json(ListResponse {
            total,
            offset,
            limit,
            data: credentials,
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

    match state.credential_repo.get_one_by_id(path.into_inner()) {
        Ok(Some(credential)) => HttpResponse::Ok().json(credential),
        Ok(None) => error_response(&SchedulerError::not_found("credential does not exist")),
        Err(e) => error_response(&e),
    }
}

pub async fn update_one(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
    body: web::Json<UpdateCredentialRequest>,
) -> HttpResponse {
    if let Err(response) = authenticate(&req, &state) {
        return response;
    }
    if let Err(e) = state.ensure_writable() {
        return error_response(&e);
    }

    match state
        .credential_repo
        .update_one_by_id(path.into_inner(), body.archived)
        .await
    {
        Ok(credential) => HttpResponse::Ok().json(credential),
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

    match state
        .credential_repo
        .delete_one_by_id(path.into_inner())
        .await
    {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}
