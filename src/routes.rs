//! HTTP route registration for the Scheduler0 server.
//!
//! Wires the actix-web application to the shared `scheduler0-api` route
//! configuration so the server keeps its entrypoint lightweight.

use actix_web::web;

/// Register all HTTP routes for the server.
pub fn configure(cfg: &mut web::ServiceConfig) {
    scheduler0_api::routes::configure_routes(cfg);
}
