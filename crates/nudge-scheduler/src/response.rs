//! Response processor: applies a user's answer to a notification.
//!
//! The state change runs under the notification's `processing` flag inside one
//! store transaction. Side effects run afterwards and never undo it.

use chrono::{DateTime, Duration, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{Clock, MetricsSink, NotificationStore, RoutineStore};
use nudge_core::types::{Notification, NotificationStatus, ResponseAction, Routine, UserResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adaptive::AdaptiveTimingUpdater;
use crate::dispatch::Dispatcher;

/// A user's answer to a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub notification_id: String,
    pub user_id: String,
    pub action: ResponseAction,
    pub response_time_seconds: u32,
    /// Only read for `snoozed`.
    #[serde(default)]
    pub snooze_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondResult {
    pub status: NotificationStatus,
    pub notification: Notification,
}

/// Snooze limits applied to incoming responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePolicy {
    pub default_snooze_minutes: u32,
    pub max_snooze_minutes: u32,
    pub enforce_max_snoozes: bool,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            default_snooze_minutes: 5,
            max_snooze_minutes: 24 * 60,
            enforce_max_snoozes: true,
        }
    }
}

impl From<&nudge_core::SchedulerConfig> for ResponsePolicy {
    fn from(c: &nudge_core::SchedulerConfig) -> Self {
        Self {
            default_snooze_minutes: c.default_snooze_minutes,
            max_snooze_minutes: c.max_snooze_minutes,
            enforce_max_snoozes: c.enforce_max_snoozes,
        }
    }
}

pub struct ResponseProcessor {
    notifications: Arc<dyn NotificationStore>,
    routines: Arc<dyn RoutineStore>,
    metrics: Arc<dyn MetricsSink>,
    adaptive: AdaptiveTimingUpdater,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    policy: ResponsePolicy,
}

impl ResponseProcessor {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        routines: Arc<dyn RoutineStore>,
        metrics: Arc<dyn MetricsSink>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        policy: ResponsePolicy,
    ) -> Self {
        Self {
            notifications,
            adaptive: AdaptiveTimingUpdater::new(routines.clone()),
            routines,
            metrics,
            dispatcher,
            clock,
            policy,
        }
    }

    /// Apply a response.
    ///
    /// - `NotFound` when the notification is absent or owned by someone else.
    /// - `Conflict` when another response holds the notification, or it is
    ///   already completed/dismissed/cancelled/failed.
    /// - `InvalidArgument` for an out-of-range snooze or an exhausted snooze budget.
    pub async fn respond(&self, req: RespondRequest) -> Result<RespondResult> {
        if let Some(minutes) = req.snooze_minutes
            && req.action == ResponseAction::Snoozed
            && (minutes == 0 || minutes > self.policy.max_snooze_minutes)
        {
            return Err(NudgeError::invalid(format!(
                "snooze minutes {minutes} outside 1..={}",
                self.policy.max_snooze_minutes
            )));
        }

        // Ownership first, so a foreign caller can't tell "busy" from "absent".
        let current = self.notifications.get_notification(&req.notification_id).await?;
        if current.user_id != req.user_id {
            return Err(NudgeError::not_found(format!("notification {}", req.notification_id)));
        }

        let routine = match self.routines.get_routine(&current.routine_id).await {
            Ok(r) => Some(r),
            Err(NudgeError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let snooze_minutes = self.snooze_minutes(&req, routine.as_ref());
        let max_snoozes = routine
            .as_ref()
            .filter(|_| self.policy.enforce_max_snoozes)
            .map(|r| r.notification_settings.max_snoozes);

        let now = self.clock.now();
        let transition = Transition {
            user_id: req.user_id.clone(),
            action: req.action,
            response_time_seconds: req.response_time_seconds,
            snooze_minutes,
            max_snoozes,
            now,
        };

        let updated = match self
            .notifications
            .transactional_update(&req.notification_id, Box::new(move |n| transition.apply(n)))
            .await
        {
            Ok(n) => n,
            Err(e @ NudgeError::Store(_)) => {
                if let Err(release_err) = self.notifications.release_processing(&req.notification_id).await {
                    tracing::error!(
                        "❌ Could not release processing flag on {}: {release_err}",
                        req.notification_id
                    );
                }
                return Err(e);
            }
            Err(e) => {
                if e.is_conflict() {
                    tracing::debug!("⏭️ Response to {} ignored: {e}", req.notification_id);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "✅ Notification {} {} by user {} after {}s",
            updated.id,
            req.action,
            req.user_id,
            req.response_time_seconds
        );

        self.after_commit(&updated, &req, routine.as_ref(), now).await;

        Ok(RespondResult {
            status: updated.status,
            notification: updated,
        })
    }

    fn snooze_minutes(&self, req: &RespondRequest, routine: Option<&Routine>) -> u32 {
        req.snooze_minutes
            .or_else(|| {
                routine
                    .map(|r| r.notification_settings.snooze_duration_minutes)
                    .filter(|m| *m > 0)
            })
            .unwrap_or(self.policy.default_snooze_minutes)
            .min(self.policy.max_snooze_minutes)
    }

    /// Best-effort side effects; failures are logged only.
    async fn after_commit(
        &self,
        updated: &Notification,
        req: &RespondRequest,
        routine: Option<&Routine>,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .metrics
            .record_response(&req.user_id, req.action, req.response_time_seconds, now)
            .await
        {
            tracing::warn!("⚠️ Metrics for {} not recorded: {e}", updated.id);
        }

        if routine.is_some_and(|r| r.adaptive_timing.enabled)
            && let Err(e) = self
                .adaptive
                .apply(&updated.routine_id, req.action, req.response_time_seconds, now)
                .await
        {
            tracing::warn!("⚠️ Adaptive timing for routine {} not updated: {e}", updated.routine_id);
        }

        self.dispatcher.sync_update(updated).await;
    }
}

/// The validated state change, applied while the processing flag is held.
struct Transition {
    user_id: String,
    action: ResponseAction,
    response_time_seconds: u32,
    snooze_minutes: u32,
    max_snoozes: Option<u32>,
    now: DateTime<Utc>,
}

impl Transition {
    fn apply(self, n: &mut Notification) -> Result<()> {
        if n.user_id != self.user_id {
            return Err(NudgeError::not_found(format!("notification {}", n.id)));
        }
        if !n.status.is_open() {
            return Err(NudgeError::conflict(format!(
                "notification {} is already {}",
                n.id, n.status
            )));
        }

        match self.action {
            ResponseAction::Completed => {
                n.completed_at = Some(self.now);
                n.snoozed_until = None;
            }
            ResponseAction::Dismissed => {
                n.snoozed_until = None;
            }
            ResponseAction::Snoozed => {
                if let Some(max) = self.max_snoozes
                    && n.snooze_count >= max
                {
                    return Err(NudgeError::invalid(format!(
                        "notification {} reached its snooze limit of {max}",
                        n.id
                    )));
                }
                n.snoozed_until = Some(self.now + Duration::minutes(i64::from(self.snooze_minutes)));
                n.snooze_count += 1;
            }
        }
        n.status = self.action.target_status();
        n.user_response = Some(UserResponse {
            action: self.action,
            response_time_seconds: self.response_time_seconds,
            timestamp: self.now,
        });
        Ok(())
    }
}
