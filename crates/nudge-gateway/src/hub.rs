//! Per-user push hub: the `PushTransport` behind the WebSocket gateway.
//!
//! Each user gets a broadcast channel; every connected device of that user
//! holds a receiver. Pushing to a user with no connected device succeeds
//! and is dropped, the same as emitting into an empty room.

use async_trait::async_trait;
use nudge_core::error::Result;
use nudge_core::traits::PushTransport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// One event as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub event: String,
    pub data: serde_json::Value,
}

pub struct PushHub {
    users: Mutex<HashMap<String, broadcast::Sender<PushEnvelope>>>,
    capacity: usize,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PushHub {
    /// `capacity` bounds how far a slow device may lag before it drops events.
    pub fn new(capacity: usize) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe a device to a user's events.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<PushEnvelope> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Number of devices currently connected for `user_id`.
    pub fn connected_devices(&self, user_id: &str) -> usize {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.get(user_id).map_or(0, |tx| tx.receiver_count())
    }

    /// Users with at least one connected device.
    pub fn online_users(&self) -> usize {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.values().filter(|tx| tx.receiver_count() > 0).count()
    }

    fn publish(&self, user_id: &str, envelope: PushEnvelope) -> usize {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = users.get(user_id) else {
            return 0;
        };
        match tx.send(envelope) {
            Ok(n) => n,
            Err(_) => {
                // Every device went away.
                users.remove(user_id);
                0
            }
        }
    }
}

#[async_trait]
impl PushTransport for PushHub {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn push_to_user(&self, user_id: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        let reached = self.publish(
            user_id,
            PushEnvelope {
                event: event.to_string(),
                data: payload,
            },
        );
        if reached == 0 {
            tracing::debug!("📭 No device online for user {user_id}, '{event}' dropped");
        } else {
            tracing::debug!("📨 '{event}' sent to {reached} device(s) of user {user_id}");
        }
        Ok(())
    }
}
