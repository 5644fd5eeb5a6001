//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use nudge_core::error::NudgeError;
use nudge_core::types::{ResponseAction, Routine};
use nudge_scheduler::RespondRequest;
use serde::Deserialize;
use std::sync::Arc;

use super::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Map the error taxonomy onto HTTP. A conflict means "already handled":
/// clients should drop it silently rather than show an error.
fn error_response(e: NudgeError) -> ApiResponse {
    let (status, extra) = match &e {
        NudgeError::NotFound(_) => (StatusCode::NOT_FOUND, serde_json::json!({})),
        NudgeError::Conflict(_) => (StatusCode::CONFLICT, serde_json::json!({"already_handled": true})),
        NudgeError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, serde_json::json!({})),
        _ => {
            tracing::error!("❌ Request failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({}))
        }
    };
    let mut body = serde_json::json!({"ok": false, "error": e.to_string()});
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        body.extend(extra.clone());
    }
    (status, Json(body))
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nudge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Scheduler status plus gateway uptime and online users.
pub async fn scheduler_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.scheduler.status();
    Json(serde_json::json!({
        "ok": true,
        "isRunning": status.is_running,
        "lastScanAt": status.last_scan_at,
        "activeCronJobs": status.active_jobs,
        "onlineUsers": state.hub.online_users(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
    pub action: String,
    /// Required; an unmeasured response would skew adaptive timing.
    #[serde(alias = "response_time_seconds", default)]
    pub response_time_seconds: Option<u64>,
    #[serde(alias = "snooze_minutes", default)]
    pub snooze_minutes: Option<u64>,
}

fn to_u32(field: &str, value: u64) -> Result<u32, NudgeError> {
    u32::try_from(value).map_err(|_| NudgeError::invalid(format!("{field} {value} is out of range")))
}

/// Validate raw respond fields shared by the HTTP and WebSocket paths.
pub(crate) fn respond_request(
    notification_id: String,
    user_id: String,
    action: &str,
    response_time_seconds: Option<u64>,
    snooze_minutes: Option<u64>,
) -> Result<RespondRequest, NudgeError> {
    let action: ResponseAction = action.parse()?;
    let response_time_seconds = response_time_seconds
        .ok_or_else(|| NudgeError::invalid("responseTimeSeconds is required"))
        .and_then(|secs| to_u32("responseTimeSeconds", secs))?;
    let snooze_minutes = snooze_minutes.map(|m| to_u32("snoozeMinutes", m)).transpose()?;
    Ok(RespondRequest {
        notification_id,
        user_id,
        action,
        response_time_seconds,
        snooze_minutes,
    })
}

/// POST /api/notifications/{id}/respond
pub async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> ApiResponse {
    let req = match respond_request(
        id,
        body.user_id,
        &body.action,
        body.response_time_seconds,
        body.snooze_minutes,
    ) {
        Ok(req) => req,
        Err(e) => return error_response(e),
    };
    match state.scheduler.respond(req).await {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "status": result.status,
                "notification": result.notification,
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// PUT /api/routines/{id}: register or replace a routine.
pub async fn schedule_routine(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut body): Json<serde_json::Value>,
) -> ApiResponse {
    match body.get("id").and_then(|v| v.as_str()) {
        Some(body_id) if body_id != id => {
            return error_response(NudgeError::invalid(format!(
                "routine id '{body_id}' does not match path '{id}'"
            )));
        }
        Some(_) => {}
        None => {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("id".into(), serde_json::Value::String(id.clone()));
            }
        }
    }
    let routine: Routine = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return error_response(NudgeError::invalid(format!("invalid routine: {e}"))),
    };
    match state.scheduler.schedule_routine(&routine).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "id": routine.id, "isActive": routine.is_active})),
        ),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/routines/{id}: deactivate and cancel open notifications.
pub async fn cancel_routine(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.scheduler.cancel_routine(&id).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "cancelled": cancelled})),
        ),
        Err(e) => error_response(e),
    }
}
