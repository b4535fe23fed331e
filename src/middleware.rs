//! Server-wide middleware constructors.

use actix_cors::Cors;
use actix_web::middleware;

/// Build the CORS policy used by the server.
pub fn build_cors() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600)
}

/// Build the request logger middleware.
pub fn request_logger() -> middleware::Logger {
    middleware::Logger::default()
}
