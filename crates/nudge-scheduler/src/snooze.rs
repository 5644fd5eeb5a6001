//! Snooze re-delivery: re-dispatches snoozed notifications once they wake.

use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use nudge_core::traits::NotificationStore;
use nudge_core::types::DeliveryKind;
use std::sync::Arc;

use crate::dispatch::{DispatchTally, Dispatcher};

pub struct SnoozeScanner {
    notifications: Arc<dyn NotificationStore>,
    dispatcher: Arc<Dispatcher>,
}

impl SnoozeScanner {
    pub fn new(notifications: Arc<dyn NotificationStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            notifications,
            dispatcher,
        }
    }

    /// Re-dispatch every notification with `snoozed_until <= now`.
    /// One failing store write does not stop the rest of the batch.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<DispatchTally> {
        let due = self.notifications.find_snoozed_due(now).await?;
        let mut tally = DispatchTally::default();
        if due.is_empty() {
            return Ok(tally);
        }
        tracing::info!("😴 {} snoozed notification(s) waking up", due.len());
        for notification in &due {
            match self
                .dispatcher
                .dispatch(notification, DeliveryKind::SnoozeReminder, now)
                .await
            {
                Ok(outcome) => tally.add(&outcome),
                Err(e) => tracing::error!("❌ Snooze re-delivery of {} failed: {e}", notification.id),
            }
        }
        Ok(tally)
    }
}
