//! Duplicate suppression: one open notification per routine per fire window.

use chrono::{DateTime, Duration, Utc};
use nudge_core::error::Result;
use nudge_core::traits::NotificationStore;
use nudge_core::types::Notification;
use std::sync::Arc;

pub struct DuplicateSuppressor {
    notifications: Arc<dyn NotificationStore>,
    /// Half-width of the window around the fire time.
    window: Duration,
}

impl DuplicateSuppressor {
    pub fn new(notifications: Arc<dyn NotificationStore>, window_minutes: i64) -> Self {
        Self {
            notifications,
            window: Duration::minutes(window_minutes),
        }
    }

    /// An open notification for the routine within `fire_time ± window`.
    /// Must be wider than the largest adaptive offset so a shifted
    /// `scheduled_for` still lands inside it.
    pub async fn existing(&self, routine_id: &str, fire_time: DateTime<Utc>) -> Result<Option<Notification>> {
        self.notifications
            .find_duplicate_candidate(routine_id, fire_time - self.window, fire_time + self.window)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::NotificationFactory;
    use crate::persistence::SqliteStore;
    use chrono::TimeZone;
    use nudge_core::types::{Routine, ScheduleEntry};

    #[tokio::test]
    async fn test_window_absorbs_max_offset() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut routine = Routine::new("r1", "u1", "Meds", vec![ScheduleEntry::parse("09:00", &[1]).unwrap()]);
        routine.adaptive_timing.offset_minutes = 15;
        let nominal = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        NotificationFactory::new(store.clone())
            .create(&routine, nominal, nominal)
            .await
            .unwrap();

        let wide = DuplicateSuppressor::new(store.clone(), 20);
        assert!(wide.existing("r1", nominal).await.unwrap().is_some());

        // The narrow 5-minute window misses a +15 shift.
        let narrow = DuplicateSuppressor::new(store, 5);
        assert!(narrow.existing("r1", nominal).await.unwrap().is_none());
    }
}
