//! Analytics sink fed by the response processor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::ResponseAction;

#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Best-effort: failures are logged by the caller, never propagated.
    async fn record_response(
        &self,
        user_id: &str,
        action: ResponseAction,
        response_time_seconds: u32,
        at: DateTime<Utc>,
    ) -> Result<()>;
}
