//! Recording push transport.
//!
//! `RecordingTransport` captures every push and can be switched into a
//! failing mode to exercise the `failed` delivery path.

use async_trait::async_trait;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::PushTransport;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One captured push.
#[derive(Debug, Clone, PartialEq)]
pub struct SentPush {
    pub user_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentPush>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following push fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Captured pushes for one event name.
    pub fn sent_events(&self, event: &str) -> Vec<SentPush> {
        self.sent().into_iter().filter(|p| p.event == event).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn push_to_user(&self, user_id: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NudgeError::Transport(format!("push to {user_id} refused")));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentPush {
                user_id: user_id.to_string(),
                event: event.to_string(),
                payload,
            });
        Ok(())
    }
}
