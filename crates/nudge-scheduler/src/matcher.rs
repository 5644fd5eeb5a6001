//! Which active routines fire at the current minute.
//!
//! Always matches against the minute `now` falls in, never a precomputed
//! target, so a tick that runs late still catches the minute it lands in.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::RoutineStore;
use nudge_core::types::Routine;
use std::sync::Arc;

/// The wall-clock minute a scan is matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueSlot {
    /// Minutes since local midnight.
    pub minute_of_day: u16,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    /// Start of the matched minute, in UTC. This is the nominal fire time.
    pub nominal: DateTime<Utc>,
}

impl DueSlot {
    /// Slot containing `now` on a wall clock `utc_offset_minutes` east of UTC.
    pub fn containing(now: DateTime<Utc>, utc_offset_minutes: i32) -> Result<Self> {
        let tz = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or_else(|| NudgeError::Config(format!("invalid UTC offset {utc_offset_minutes}")))?;
        let local = now.with_timezone(&tz);
        let nominal = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        Ok(Self {
            minute_of_day: (local.hour() * 60 + local.minute()) as u16,
            weekday: local.weekday().num_days_from_sunday() as u8,
            nominal,
        })
    }
}

pub struct DueRoutineMatcher {
    routines: Arc<dyn RoutineStore>,
    utc_offset_minutes: i32,
}

impl DueRoutineMatcher {
    pub fn new(routines: Arc<dyn RoutineStore>, utc_offset_minutes: i32) -> Self {
        Self {
            routines,
            utc_offset_minutes,
        }
    }

    /// Active routines with an entry at the minute containing `now`.
    /// Each routine appears once even if several of its entries match.
    pub async fn due_at(&self, now: DateTime<Utc>) -> Result<(DueSlot, Vec<Routine>)> {
        let slot = DueSlot::containing(now, self.utc_offset_minutes)?;
        let mut due = self
            .routines
            .find_active_routines_due_at(slot.minute_of_day, slot.weekday)
            .await?;
        due.retain(|r| r.is_active && r.fires_at(slot.minute_of_day, slot.weekday));
        due.dedup_by(|a, b| a.id == b.id);
        Ok((slot, due))
    }
}
