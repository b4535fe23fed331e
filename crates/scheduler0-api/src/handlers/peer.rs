//! Peer API handlers: connect probing and the fan-in serving side.

use actix_web::{web, HttpRequest, HttpResponse};
use scheduler0_core::peer_client::{PeerConnectRequest, PeerConnectResponse, UncommittedLogsResponse};

use crate::auth::authenticate_peer;
use crate::models::{error_response, UncommittedLogsQuery};
use crate::state::AppState;

pub async fn connect(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<PeerConnectRequest>,
) -> HttpResponse {
    if let Err(response) = authenticate_peer(&req, &state) {
        return response;
    }

    log::debug!(
        "peer {} connected from {}",
        body.node_id,
        body.address
    );
    HttpResponse::Ok().json(PeerConnectResponse {
        is_auth: true,
        is_alive: true,
        is_leader: state.coordinator.is_leader(),
    })
}

pub async fn uncommitted_logs(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<UncommittedLogsQuery>,
) -> HttpResponse {
    if let Err(response) = authenticate_peer(&req, &state) {
        return response;
    }

    match state.coordinator.serve_uncommitted_logs(&query.request_id) {
        Ok(async_task_id) => HttpResponse::Ok().json(UncommittedLogsResponse { async_task_id }),
        Err(e) => error_response(&e),
    }
}

pub async fn async_task(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> HttpResponse {
    if let Err(response) = authenticate_peer(&req, &state) {
        return response;
    }

    match state.coordinator.serve_async_task(path.into_inner()) {
        Ok(task) => HttpResponse::Ok().json(task),
        Err(e) => error_response(&e),
    }
}
