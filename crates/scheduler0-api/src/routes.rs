//! Route registration.

use actix_web::web;

use crate::handlers;

/// Wire every client, peer, and raft endpoint onto the application.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Healthcheck (unauthenticated liveness probe)
        .route("/healthcheck", web::get().to(handlers::health::healthcheck))
        // Executions
        .route("/executions", web::get().to(handlers::executions::list))
        // Credentials
        .route("/credentials", web::post().to(handlers::credentials::create))
        .route("/credentials", web::get().to(handlers::credentials::list))
        .route(
            "/credentials/{id}",
            web::get().to(handlers::credentials::get_one),
        )
        .route(
            "/credentials/{id}",
            web::put().to(handlers::credentials::update_one),
        )
        .route(
            "/credentials/{id}",
            web::delete().to(handlers::credentials::delete_one),
        )
        // Jobs
        .route("/job", web::post().to(handlers::jobs::create_one))
        .route("/jobs", web::post().to(handlers::jobs::batch_create))
        .route("/jobs", web::get().to(handlers::jobs::list))
        .route("/jobs/{id}", web::get().to(handlers::jobs::get_one))
        .route("/jobs/{id}", web::put().to(handlers::jobs::update_one))
        .route("/jobs/{id}", web::delete().to(handlers::jobs::delete_one))
        // Projects
        .route("/projects", web::post().to(handlers::projects::create))
        .route("/projects", web::get().to(handlers::projects::list))
        .route("/projects/{id}", web::get().to(handlers::projects::get_one))
        .route(
            "/projects/{id}",
            web::put().to(handlers::projects::update_one),
        )
        .route(
            "/projects/{id}",
            web::delete().to(handlers::projects::delete_one),
        )
        // Peer API
        .route("/peer/connect", web::post().to(handlers::peer::connect))
        .route(
            "/peer/uncommitted-logs",
            web::get().to(handlers::peer::uncommitted_logs),
        )
        .route(
            "/peer/async-task/{id}",
            web::get().to(handlers::peer::async_task),
        )
        // Raft RPC
        .route("/raft/vote", web::post().to(handlers::raft_rpc::vote))
        .route(
            "/raft/append",
            web::post().to(handlers::raft_rpc::append_entries),
        )
        .route(
            "/raft/snapshot",
            web::post().to(handlers::raft_rpc::install_snapshot),
        );
}
