use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Span, field::Empty};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Span for every daemon request. `request_id` is filled in by
/// [`request_context`] once the id is known.
pub fn make_request_span(req: &Request<Body>) -> Span {
    tracing::info_span!(
        "request",
        http.method = %req.method(),
        http.path = %req.uri().path(),
        request_id = Empty,
    )
}

/// Tags the request span with a request id and echoes it back, reusing the
/// caller's `x-request-id` when present.
pub async fn request_context(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Span::current().record("request_id", request_id.as_str());

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
