//! Deletes terminal notifications past the retention horizon.

use chrono::{DateTime, Duration, Utc};
use nudge_core::error::Result;
use nudge_core::traits::NotificationStore;
use nudge_core::types::NotificationStatus;
use std::sync::Arc;

pub struct RetentionSweeper {
    notifications: Arc<dyn NotificationStore>,
    horizon: Duration,
}

impl RetentionSweeper {
    pub fn new(notifications: Arc<dyn NotificationStore>, retention_days: i64) -> Self {
        Self {
            notifications,
            horizon: Duration::days(retention_days),
        }
    }

    /// Delete completed/dismissed/cancelled/failed notifications older than the horizon.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.horizon;
        let deleted = self
            .notifications
            .delete_older_than(cutoff, &NotificationStatus::TERMINAL)
            .await?;
        if deleted > 0 {
            tracing::info!("🧹 Retention sweep removed {deleted} notification(s) older than {}", cutoff.format("%Y-%m-%d"));
        }
        Ok(deleted)
    }
}
