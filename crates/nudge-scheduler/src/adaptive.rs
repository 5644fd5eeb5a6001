//! Adaptive timing: nudges a routine's delivery offset from response outcomes.
//!
//! A bounded integrator: each response moves the offset by a fixed step from
//! the table below, then the result is clamped to `[-15, +15]` minutes. The
//! store applies the step atomically, so responses to different
//! notifications of one routine never lose an adjustment.

use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use nudge_core::traits::RoutineStore;
use nudge_core::types::{ResponseAction, clamp_offset};
use std::sync::Arc;

/// Completions faster than this pull the offset earlier.
pub const FAST_RESPONSE_SECS: u32 = 30;
/// Completions slower than this push the offset later.
pub const SLOW_RESPONSE_SECS: u32 = 120;

/// Offset change for one response, before clamping.
pub fn offset_delta(action: ResponseAction, response_time_seconds: u32) -> i32 {
    match action {
        ResponseAction::Completed if response_time_seconds < FAST_RESPONSE_SECS => -1,
        ResponseAction::Completed if response_time_seconds > SLOW_RESPONSE_SECS => 2,
        ResponseAction::Completed => 0,
        ResponseAction::Dismissed => 5,
        ResponseAction::Snoozed => 3,
    }
}

/// Next offset after a response, clamped.
pub fn adjust_offset(current: i32, action: ResponseAction, response_time_seconds: u32) -> i32 {
    clamp_offset(current.saturating_add(offset_delta(action, response_time_seconds)))
}

pub struct AdaptiveTimingUpdater {
    routines: Arc<dyn RoutineStore>,
}

impl AdaptiveTimingUpdater {
    pub fn new(routines: Arc<dyn RoutineStore>) -> Self {
        Self { routines }
    }

    /// Apply one response to the routine's offset.
    /// Returns the new offset, or `None` when adaptive timing is disabled.
    pub async fn apply(
        &self,
        routine_id: &str,
        action: ResponseAction,
        response_time_seconds: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        let delta = offset_delta(action, response_time_seconds);
        let Some(adjusted) = self.routines.adjust_adaptive_offset(routine_id, delta, now).await? else {
            return Ok(None);
        };
        if adjusted.current != adjusted.previous {
            tracing::info!(
                "🎯 Routine {routine_id} offset {:+}m → {:+}m after {action} in {response_time_seconds}s",
                adjusted.previous,
                adjusted.current
            );
        }
        Ok(Some(adjusted.current))
    }
}
