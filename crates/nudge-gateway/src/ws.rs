//! WebSocket handler: one connection per device, subscribed to its user's events.
//!
//! Protocol:
//! → Client connects: GET /ws?user_id=u1
//! ← Server sends: {"type":"connected","user_id":"u1","version":"..."}
//! ← Server sends: {"type":"notification","data":{id,title,message,sound,volume,routineId,timestamp,type}}
//! ← Server sends: {"type":"notification-updated","data":{id,status,userResponse,snoozedUntil,completedAt}}
//! → Client sends: {"type":"respond","notification_id":"...","action":"snoozed","response_time_seconds":12,"snooze_minutes":5}
//! ← Server sends: {"type":"respond_result","notification_id":"...","status":"snoozed"}
//! → Client sends: {"type":"ping"}
//! ← Server sends: {"type":"pong"}

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use nudge_core::error::NudgeError;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use super::hub::PushEnvelope;
use super::routes::respond_request;
use super::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(user_id) = params.user_id.filter(|u| !u.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "user_id query parameter is required").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handle a WebSocket connection.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let mut events = state.hub.subscribe(&user_id);
    tracing::info!(
        "🔌 Device connected for user {user_id} ({} online)",
        state.hub.connected_devices(&user_id)
    );

    let welcome = serde_json::json!({
        "type": "connected",
        "user_id": &user_id,
        "version": env!("CARGO_PKG_VERSION"),
    });
    if send_json(&mut socket, &welcome).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(envelope) => {
                    if send_json(&mut socket, &event_frame(&envelope)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Device of user {user_id} lagged, {skipped} event(s) dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&mut socket, &state, &user_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("WS receive error for user {user_id}: {e}");
                    break;
                }
            },
        }
    }

    tracing::info!("🔌 Device disconnected for user {user_id}");
}

fn event_frame(envelope: &PushEnvelope) -> serde_json::Value {
    serde_json::json!({
        "type": envelope.event,
        "data": envelope.data,
    })
}

async fn handle_client_message(socket: &mut WebSocket, state: &AppState, user_id: &str, text: &str) {
    let json = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(j) => j,
        Err(e) => {
            send_error(socket, &format!("Invalid JSON: {e}")).await;
            return;
        }
    };

    match json["type"].as_str().unwrap_or("unknown") {
        "ping" => {
            let _ = send_json(socket, &serde_json::json!({"type": "pong"})).await;
        }
        "respond" => {
            let notification_id = json["notification_id"].as_str().unwrap_or("").to_string();
            if notification_id.is_empty() {
                send_error(socket, "notification_id is required").await;
                return;
            }
            let req = opt_u64(&json, "response_time_seconds")
                .and_then(|secs| opt_u64(&json, "snooze_minutes").map(|mins| (secs, mins)))
                .and_then(|(secs, mins)| {
                    respond_request(
                        notification_id.clone(),
                        user_id.to_string(),
                        json["action"].as_str().unwrap_or(""),
                        secs,
                        mins,
                    )
                });
            let req = match req {
                Ok(req) => req,
                Err(e) => {
                    send_error(socket, &e.to_string()).await;
                    return;
                }
            };
            let reply = match state.scheduler.respond(req).await {
                Ok(result) => serde_json::json!({
                    "type": "respond_result",
                    "notification_id": notification_id,
                    "status": result.status,
                }),
                Err(e) => serde_json::json!({
                    "type": "respond_result",
                    "notification_id": notification_id,
                    "error": e.to_string(),
                    "already_handled": e.is_conflict(),
                }),
            };
            let _ = send_json(socket, &reply).await;
        }
        other => {
            send_error(socket, &format!("Unknown message type: {other}")).await;
        }
    }
}

/// Absent or null → `None`; anything but a non-negative integer → `InvalidArgument`.
fn opt_u64(json: &serde_json::Value, field: &str) -> nudge_core::Result<Option<u64>> {
    match json.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| NudgeError::invalid(format!("{field} must be a non-negative integer"))),
    }
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), ()> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|e| {
            tracing::error!("WS send failed: {e}");
        })
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let error = serde_json::json!({
        "type": "error",
        "message": message,
    });
    let _ = send_json(socket, &error).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_uses_event_as_type() {
        let frame = event_frame(&PushEnvelope {
            event: "notification-updated".into(),
            data: serde_json::json!({"id": "n1", "status": "completed"}),
        });
        assert_eq!(frame["type"], "notification-updated");
        assert_eq!(frame["data"]["status"], "completed");
    }

    #[test]
    fn test_respond_fields_are_validated_not_truncated() {
        let msg = serde_json::json!({
            "type": "respond",
            "notification_id": "n1",
            "action": "snoozed",
            "response_time_seconds": 12,
            "snooze_minutes": 4_294_967_301u64,
        });
        let mins = opt_u64(&msg, "snooze_minutes").unwrap();
        let err = respond_request("n1".into(), "u1".into(), "snoozed", Some(12), mins).unwrap_err();
        assert!(matches!(err, NudgeError::InvalidArgument(_)));

        let negative = serde_json::json!({"response_time_seconds": -3});
        assert!(opt_u64(&negative, "response_time_seconds").is_err());
        assert_eq!(opt_u64(&negative, "snooze_minutes").unwrap(), None);

        let err = respond_request("n1".into(), "u1".into(), "completed", None, None).unwrap_err();
        assert!(matches!(err, NudgeError::InvalidArgument(_)));
    }
}
