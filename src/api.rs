use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::control::{ControlName, ControlValue};
use crate::engine::{Event, EventSender};
use crate::group::GroupSnapshot;
use crate::state::GroupStates;

/// Shared application state
pub struct AppState {
    pub states: Arc<GroupStates>,
    pub events: EventSender,
    pub started: Instant,
}

/// POST /api/groups/{id}/controls/{control} request body
#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub value: ControlValue,
}

#[derive(Serialize)]
struct ApiMessage {
    message: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/health", get(health))
        .route("/api/groups", get(get_groups))
        .route("/api/groups/:id", get(get_group))
        .route("/api/groups/:id/button", post(press_button))
        .route("/api/groups/:id/controls/:control", post(write_control))
        .with_state(state)
}

/// GET /api/: API running check
async fn api_status() -> Json<ApiMessage> {
    Json(ApiMessage {
        message: "API running.".to_string(),
    })
}

/// GET /api/health: health check with processing counters
async fn health(State(app): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "group_count": app.states.len(),
        "uptime_seconds": app.started.elapsed().as_secs(),
        "metrics": app.states.metrics.snapshot(),
    }))
}

/// GET /api/groups: every group snapshot
async fn get_groups(State(app): State<Arc<AppState>>) -> Json<Vec<GroupSnapshot>> {
    Json(app.states.get_all())
}

/// GET /api/groups/{id}
async fn get_group(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<GroupSnapshot>, StatusCode> {
    app.states.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/groups/{id}/button: same as pressing the virtual button
async fn press_button(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ApiMessage>), StatusCode> {
    queue_write(&app, id, ControlName::Button, ControlValue::Bool(true))
}

/// POST /api/groups/{id}/controls/{control}
async fn write_control(
    State(app): State<Arc<AppState>>,
    Path((id, control)): Path<(String, String)>,
    Json(body): Json<WriteRequest>,
) -> Result<(StatusCode, Json<ApiMessage>), StatusCode> {
    let name = ControlName::parse(&control).ok_or(StatusCode::NOT_FOUND)?;
    queue_write(&app, id, name, body.value)
}

fn queue_write(
    app: &AppState,
    id: String,
    control: ControlName,
    value: ControlValue,
) -> Result<(StatusCode, Json<ApiMessage>), StatusCode> {
    let snapshot = app.states.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    if !control_exists(&snapshot, control) {
        return Err(StatusCode::NOT_FOUND);
    }
    if !control.is_writable() {
        return Err(StatusCode::CONFLICT);
    }

    tracing::info!(group = %id, control = %control, ?value, "Control write via API");
    app.events
        .send(Event::ControlWritten {
            group: id.clone(),
            control,
            value,
        })
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiMessage {
            message: format!("{} queued for {}.", control, id),
        }),
    ))
}

/// Whether the group's device carries this control at all.
fn control_exists(snapshot: &GroupSnapshot, control: ControlName) -> bool {
    match control {
        ControlName::Light(i) => i < snapshot.qty_light,
        ControlName::ButtonMirror(i) => i < snapshot.qty_button,
        ControlName::ButtonAlarm => snapshot.button_alarm,
        ControlName::MotionSensor(i) => snapshot
            .motion
            .as_ref()
            .is_some_and(|m| i < m.sensors.len()),
        other if other.needs_motion() => snapshot.motion.is_some(),
        _ => true,
    }
}
