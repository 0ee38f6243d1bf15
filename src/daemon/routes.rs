use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use super::DaemonState;
use super::auth::require_auth;
use super::handlers;
use super::middleware;

pub fn build_router(state: DaemonState) -> Router {
    let auth = state.auth.clone();

    let actions = Router::new()
        .route("/command", post(handlers::command))
        .route("/keyboard/key_down", post(handlers::key_down))
        .route("/keyboard/key_up", post(handlers::key_up))
        .route("/keyboard/key_release", post(handlers::key_up))
        .route("/keyboard/key_press", post(handlers::key_press))
        .route("/keyboard/hotkey", post(handlers::hotkey))
        .route("/type", post(handlers::type_text))
        .route("/mouse/move", post(handlers::mouse_move))
        .route("/mouse/scroll", post(handlers::mouse_scroll))
        .route("/mouse/button_down", post(handlers::mouse_down))
        .route("/mouse/button_up", post(handlers::mouse_up));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/reset", post(handlers::reset))
        .nest("/execute", actions)
        .route("/observation", get(handlers::observation))
        .route("/observation/screenshot", get(handlers::screenshot))
        .route("/observation/mouse_state", get(handlers::mouse_state))
        .route("/observation/keyboard_state", get(handlers::keyboard_state))
        .route("/vnc/start", post(handlers::vnc_start))
        .route("/vnc/stop", post(handlers::vnc_stop))
        .route("/rdp/start", post(handlers::rdp_start))
        .route("/rdp/stop", post(handlers::rdp_stop))
        .fallback(handlers::not_found)
        .with_state(state)
        // Auth wraps the fallback too: unknown paths are 401 before 404.
        .layer(from_fn_with_state(auth, require_auth))
        .layer(from_fn(middleware::request_context))
        .layer(TraceLayer::new_for_http().make_span_with(middleware::make_request_span))
}
