//! Notification factory: turns a due routine into a persisted pending notification.

use chrono::{DateTime, Duration, Utc};
use nudge_core::error::Result;
use nudge_core::traits::NotificationStore;
use nudge_core::types::{Notification, NotificationMetadata, NotificationStatus, Routine};
use std::sync::Arc;

pub struct NotificationFactory {
    notifications: Arc<dyn NotificationStore>,
}

impl NotificationFactory {
    pub fn new(notifications: Arc<dyn NotificationStore>) -> Self {
        Self { notifications }
    }

    /// Build a pending notification for `routine` firing at `nominal`.
    /// Delivery fields are copied, so later routine edits don't touch it.
    pub fn build(routine: &Routine, nominal: DateTime<Utc>, now: DateTime<Utc>) -> Notification {
        let offset = routine.effective_offset();
        let message = if routine.description.trim().is_empty() {
            format!("Time for {}", routine.title)
        } else {
            routine.description.clone()
        };
        Notification {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: routine.user_id.clone(),
            routine_id: routine.id.clone(),
            title: routine.title.clone(),
            message,
            sound: routine.sound.clone(),
            volume: routine.volume,
            status: NotificationStatus::Pending,
            scheduled_for: nominal + Duration::minutes(i64::from(offset)),
            delivered_at: None,
            completed_at: None,
            snoozed_until: None,
            user_response: None,
            delivery_attempts: 0,
            snooze_count: 0,
            processing: false,
            version: 0,
            metadata: NotificationMetadata {
                adaptive_adjustment_applied: offset,
            },
            created_at: now,
        }
    }

    /// Build and persist. Dispatch is a separate step.
    pub async fn create(&self, routine: &Routine, nominal: DateTime<Utc>, now: DateTime<Utc>) -> Result<Notification> {
        let notification = Self::build(routine, nominal, now);
        self.notifications.create_notification(&notification).await?;
        tracing::debug!(
            "🆕 Notification {} created for routine '{}' (scheduled {}, offset {:+}m)",
            notification.id,
            routine.title,
            notification.scheduled_for.format("%Y-%m-%d %H:%M"),
            notification.metadata.adaptive_adjustment_applied
        );
        Ok(notification)
    }
}
