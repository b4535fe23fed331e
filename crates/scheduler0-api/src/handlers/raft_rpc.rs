//! Raft RPC endpoints.
//!
//! Replication traffic between peers rides the same HTTP server as the rest
//! of the API. The response body is the raft core's `Result`, so remote
//! errors round-trip intact to the calling node's network layer.

use actix_web::{web, HttpResponse};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use scheduler0_raft::{NodeId, TypeConfig};

use crate::state::AppState;

pub async fn vote(
    state: web::Data<AppState>,
    body: web::Json<VoteRequest<NodeId>>,
) -> HttpResponse {
    let result = state.raft.vote(body.into_inner()).await;
    HttpResponse::Ok().json(result)
}

pub async fn append_entries(
    state: web::Data<AppState>,
    body: web::Json<AppendEntriesRequest<TypeConfig>>,
) -> HttpResponse {
    let result = state.raft.append_entries(body.into_inner()).await;
    HttpResponse::Ok().json(result)
}

pub async fn install_snapshot(
    state: web::Data<AppState>,
    body: web::Json<InstallSnapshotRequest<TypeConfig>>,
) -> HttpResponse {
    let result = state.raft.install_snapshot(body.into_inner()).await;
    HttpResponse::Ok().json(result)
}
