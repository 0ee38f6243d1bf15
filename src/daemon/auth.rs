//! Bearer-token authentication for every daemon request.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use subtle::ConstantTimeEq;

use crate::protocol::ErrorBody;

const TOKEN_BYTES: usize = 32;

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Clone)]
pub struct AuthConfig {
    token: Arc<String>,
}

impl AuthConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(token.into()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn accepts(&self, presented: &str) -> bool {
        constant_time_eq(presented, &self.token)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Runs before routing, so unknown paths and observation endpoints are
/// rejected the same way as actions.
pub async fn require_auth(State(auth): State<AuthConfig>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if auth.accepts(token.trim()) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "rejected request with invalid token");
            unauthorized("invalid token")
        }
        None => unauthorized("missing bearer token"),
    }
}
