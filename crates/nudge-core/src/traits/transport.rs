//! Push channel toward a user's connected sessions.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Push `payload` under `event` to every session of `user_id`.
    /// Best-effort: `Ok` means the push did not fail, not that it was seen.
    async fn push_to_user(&self, user_id: &str, event: &str, payload: serde_json::Value) -> Result<()>;
}
