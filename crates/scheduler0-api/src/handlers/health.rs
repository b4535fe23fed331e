//! Liveness handler. Unauthenticated.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

pub async fn healthcheck(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "nodeId": state.coordinator.node_id(),
        "isLeader": state.coordinator.is_leader(),
        "leaderAddress": state.coordinator.leader_http_address(),
        "acceptingWrites": state.coordinator.can_accept_writes(),
    }))
}
