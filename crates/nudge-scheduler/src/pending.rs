//! Pending sweep: dispatches pending notifications whose time has come.
//!
//! Covers both a crash between create and dispatch and notifications whose
//! adaptive offset pushed `scheduled_for` past the tick that created them.

use chrono::{DateTime, Duration, Utc};
use nudge_core::error::Result;
use nudge_core::traits::NotificationStore;
use nudge_core::types::DeliveryKind;
use std::sync::Arc;

use crate::dispatch::{DispatchTally, Dispatcher};

pub struct PendingSweep {
    notifications: Arc<dyn NotificationStore>,
    dispatcher: Arc<Dispatcher>,
    grace: Duration,
}

impl PendingSweep {
    pub fn new(notifications: Arc<dyn NotificationStore>, dispatcher: Arc<Dispatcher>, grace_secs: i64) -> Self {
        Self {
            notifications,
            dispatcher,
            grace: Duration::seconds(grace_secs),
        }
    }

    /// Dispatch pending notifications scheduled at or before `now - grace`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<DispatchTally> {
        let due = self.notifications.find_pending_due(now - self.grace).await?;
        let mut tally = DispatchTally::default();
        for notification in &due {
            match self
                .dispatcher
                .dispatch(notification, DeliveryKind::Reminder, now)
                .await
            {
                Ok(outcome) => tally.add(&outcome),
                Err(e) => tracing::error!("❌ Dispatch of pending {} failed: {e}", notification.id),
            }
        }
        Ok(tally)
    }
}
