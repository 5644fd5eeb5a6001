//! Delivery dispatcher: pushes a notification to its owner and records the attempt.
//!
//! The row is claimed (its `processing` flag taken) before the push, so a
//! notification cancelled or answered after a scanner fetched it is never
//! pushed. The outcome is written after the push so `delivery_attempts`
//! counts real attempts, including failed ones. Failed deliveries are not
//! retried here.

use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use nudge_core::traits::{DeliveryOutcome, NotificationStore, PushTransport};
use nudge_core::types::{
    DeliveryKind, EVENT_NOTIFICATION, EVENT_NOTIFICATION_UPDATED, Notification, NotificationUpdate, PushPayload,
};
use serde::Serialize;
use std::sync::Arc;

/// What a single dispatch call ended in.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Pushed and marked `delivered`.
    Delivered(Notification),
    /// Push failed; marked `failed`.
    Failed { id: String, reason: String },
    /// The notification was no longer pending/snoozed, or was cancelled
    /// while the push was in flight.
    Superseded { id: String },
}

pub struct Dispatcher {
    notifications: Arc<dyn NotificationStore>,
    transport: Arc<dyn PushTransport>,
}

impl Dispatcher {
    pub fn new(notifications: Arc<dyn NotificationStore>, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            notifications,
            transport,
        }
    }

    /// Claim `notification`, push it to its owner, then record the attempt.
    /// Errors only on store failure; transport failure is an outcome.
    pub async fn dispatch(
        &self,
        notification: &Notification,
        kind: DeliveryKind,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let Some(claimed) = self.notifications.claim_for_delivery(&notification.id).await? else {
            tracing::debug!("⏭️ Notification {} is no longer due for delivery", notification.id);
            return Ok(DispatchOutcome::Superseded {
                id: notification.id.clone(),
            });
        };

        let recorded = match self.push_and_record(&claimed, kind, now).await {
            Ok(recorded) => recorded,
            Err(e) => {
                if let Err(release_err) = self.notifications.release_processing(&claimed.id).await {
                    tracing::error!("❌ Could not release delivery claim on {}: {release_err}", claimed.id);
                }
                return Err(e);
            }
        };

        Ok(match recorded {
            (None, _) => {
                tracing::debug!("⏭️ Notification {} was cancelled during dispatch", claimed.id);
                DispatchOutcome::Superseded { id: claimed.id }
            }
            (Some(_), Some(reason)) => DispatchOutcome::Failed { id: claimed.id, reason },
            (Some(delivered), None) => {
                tracing::info!(
                    "🔔 Delivered '{}' to user {} (attempt {})",
                    delivered.title,
                    delivered.user_id,
                    delivered.delivery_attempts
                );
                DispatchOutcome::Delivered(delivered)
            }
        })
    }

    async fn push_and_record(
        &self,
        notification: &Notification,
        kind: DeliveryKind,
        now: DateTime<Utc>,
    ) -> Result<(Option<Notification>, Option<String>)> {
        let payload = serde_json::to_value(PushPayload::for_notification(notification, kind, now))?;
        let pushed = self
            .transport
            .push_to_user(&notification.user_id, EVENT_NOTIFICATION, payload)
            .await;

        let (outcome, reason) = match pushed {
            Ok(()) => (DeliveryOutcome::Delivered, None),
            Err(e) => {
                tracing::warn!(
                    "⚠️ Push of notification {} to user {} via {} failed: {e}",
                    notification.id,
                    notification.user_id,
                    self.transport.name()
                );
                (DeliveryOutcome::Failed, Some(e.to_string()))
            }
        };

        let recorded = self
            .notifications
            .record_delivery(&notification.id, outcome, now)
            .await?;
        Ok((recorded, reason))
    }

    /// Best-effort `notification-updated` push for cross-device sync.
    pub async fn sync_update(&self, notification: &Notification) {
        let payload = match serde_json::to_value(NotificationUpdate::from(notification)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ Could not encode update for {}: {e}", notification.id);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .push_to_user(&notification.user_id, EVENT_NOTIFICATION_UPDATED, payload)
            .await
        {
            tracing::warn!("⚠️ Sync push for notification {} failed: {e}", notification.id);
        }
    }
}

/// Tally of a batch of dispatches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchTally {
    pub delivered: usize,
    pub failed: usize,
    pub superseded: usize,
}

impl DispatchTally {
    pub fn add(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered(_) => self.delivered += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Superseded { .. } => self.superseded += 1,
        }
    }
}
