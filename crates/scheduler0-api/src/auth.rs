//! Request authentication.
//!
//! Two principals: clients presenting an `(x-api-key, x-api-secret)` header
//! pair checked against the credentials table, and peers presenting the
//! cluster's basic-auth credential from the environment.

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse};
use base64::Engine;

use crate::models::ErrorBody;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_SECRET_HEADER: &str = "x-api-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Client,
    Peer,
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(ErrorBody {
        error: "unauthorized".to_string(),
        code: 401,
    })
}

fn header_value<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

/// Basic-auth pair from the `Authorization` header, if present and well
/// formed.
fn basic_auth(req: &HttpRequest) -> Option<(String, String)> {
    let value = header_value(req, header::AUTHORIZATION.as_str())?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Authenticate a client or peer request.
pub fn authenticate(req: &HttpRequest, state: &AppState) -> Result<Principal, HttpResponse> {
    if let (Some(key), Some(secret)) = (
        header_value(req, API_KEY_HEADER),
        header_value(req, API_SECRET_HEADER),
    ) {
        match state.credential_repo.find_by_key_and_secret(key, secret) {
            Ok(Some(_)) => return Ok(Principal::Client),
            Ok(None) => return Err(unauthorized()),
            Err(e) => {
                log::error!("credential lookup failed: {e}");
                return Err(unauthorized());
            }
        }
    }

    if let Some((username, password)) = basic_auth(req) {
        let (expected_user, expected_password) = &state.peer_auth;
        if username == *expected_user && password == *expected_password {
            return Ok(Principal::Peer);
        }
    }

    Err(unauthorized())
}

/// Authenticate a peer-only endpoint.
pub fn authenticate_peer(req: &HttpRequest, state: &AppState) -> Result<(), HttpResponse> {
    match basic_auth(req) {
        Some((username, password))
            if username == state.peer_auth.0 && password == state.peer_auth.1 =>
        {
            Ok(())
        }
        _ => Err(unauthorized()),
    }
}
