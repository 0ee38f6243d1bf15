use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};

use super::DaemonState;
use super::computer::ComputerError;
use crate::protocol::{
    Action, ActionResponse, CommandAction, ErrorBody, HealthResponse, HotkeyAction, KeyDownAction,
    KeyPressAction, KeyUpAction, KeyboardStateObservation, MouseButtonAction, MouseMoveAction,
    MouseScrollAction, MouseStateObservation, Observation, ScreenshotObservation, TypeAction,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

fn observation_error(what: &str, err: ComputerError) -> (StatusCode, Json<ErrorBody>) {
    let status = match err {
        ComputerError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => {
            tracing::error!(observation = what, error = %err, "observation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

pub async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not found".into(),
        }),
    )
}

pub async fn reset(State(state): State<DaemonState>) -> Json<ActionResponse> {
    match state.computer.reset().await {
        Ok(()) => Json(ActionResponse::ok("Reset successful")),
        Err(e) => {
            tracing::warn!(error = %e, "reset failed");
            Json(ActionResponse::failed(format!("Reset failed: {e}")))
        }
    }
}

// ── Actions ─────────────────────────────────────────────────────────

#[tracing::instrument(skip_all, fields(action = action.name()))]
async fn dispatch(state: &DaemonState, action: Action) -> Json<ActionResponse> {
    let name = action.name();
    match state.computer.execute(action).await {
        Ok(()) => Json(ActionResponse::ok(format!("{name} executed"))),
        Err(e) => {
            tracing::warn!(error = %e, "action failed");
            Json(ActionResponse::failed(format!("{name} failed: {e}")))
        }
    }
}

pub async fn command(
    State(state): State<DaemonState>,
    Json(body): Json<CommandAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::Command(body)).await
}

pub async fn key_down(
    State(state): State<DaemonState>,
    Json(body): Json<KeyDownAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::KeyDown(body)).await
}

pub async fn key_up(
    State(state): State<DaemonState>,
    Json(body): Json<KeyUpAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::KeyUp(body)).await
}

pub async fn key_press(
    State(state): State<DaemonState>,
    Json(body): Json<KeyPressAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::KeyPress(body)).await
}

pub async fn hotkey(
    State(state): State<DaemonState>,
    Json(body): Json<HotkeyAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::Hotkey(body)).await
}

pub async fn type_text(
    State(state): State<DaemonState>,
    Json(body): Json<TypeAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::Type(body)).await
}

pub async fn mouse_move(
    State(state): State<DaemonState>,
    Json(body): Json<MouseMoveAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::MouseMove(body)).await
}

pub async fn mouse_scroll(
    State(state): State<DaemonState>,
    Json(body): Json<MouseScrollAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::MouseScroll(body)).await
}

pub async fn mouse_down(
    State(state): State<DaemonState>,
    Json(body): Json<MouseButtonAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::MouseDown(body)).await
}

pub async fn mouse_up(
    State(state): State<DaemonState>,
    Json(body): Json<MouseButtonAction>,
) -> Json<ActionResponse> {
    dispatch(&state, Action::MouseUp(body)).await
}

// ── Observations ────────────────────────────────────────────────────

pub async fn screenshot(State(state): State<DaemonState>) -> ApiResult<ScreenshotObservation> {
    state
        .computer
        .screenshot()
        .await
        .map(Json)
        .map_err(|e| observation_error("screenshot", e))
}

pub async fn mouse_state(State(state): State<DaemonState>) -> ApiResult<MouseStateObservation> {
    state
        .computer
        .mouse_state()
        .await
        .map(Json)
        .map_err(|e| observation_error("mouse_state", e))
}

pub async fn keyboard_state(
    State(state): State<DaemonState>,
) -> ApiResult<KeyboardStateObservation> {
    state
        .computer
        .keyboard_state()
        .await
        .map(Json)
        .map_err(|e| observation_error("keyboard_state", e))
}

/// Parts the computer cannot provide come back as `null`.
pub async fn observation(State(state): State<DaemonState>) -> Json<Observation> {
    let computer = &state.computer;
    let (screenshot, mouse, keyboard) = tokio::join!(
        computer.screenshot(),
        computer.mouse_state(),
        computer.keyboard_state(),
    );
    Json(Observation {
        screenshot: screenshot.inspect_err(log_partial("screenshot")).ok(),
        mouse_state: mouse.inspect_err(log_partial("mouse_state")).ok(),
        keyboard_state: keyboard.inspect_err(log_partial("keyboard_state")).ok(),
    })
}

fn log_partial(what: &'static str) -> impl Fn(&ComputerError) {
    move |e| match e {
        ComputerError::Unsupported(_) => {}
        other => tracing::warn!(observation = what, error = %other, "observation part failed"),
    }
}

// ── Side channels ───────────────────────────────────────────────────

pub async fn vnc_start(State(state): State<DaemonState>) -> Json<ActionResponse> {
    Json(state.vnc.start(state.computer.as_ref()).await)
}

pub async fn vnc_stop(State(state): State<DaemonState>) -> Json<ActionResponse> {
    Json(state.vnc.stop(state.computer.as_ref()).await)
}

pub async fn rdp_start(State(state): State<DaemonState>) -> Json<ActionResponse> {
    Json(state.rdp.start(state.computer.as_ref()).await)
}

pub async fn rdp_stop(State(state): State<DaemonState>) -> Json<ActionResponse> {
    Json(state.rdp.stop(state.computer.as_ref()).await)
}
