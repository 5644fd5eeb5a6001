//! End-to-end reminder flows driven by a manual clock and a recording transport.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use nudge_core::traits::{ManualClock, NotificationStore, RoutineStore};
use nudge_core::types::{
    DeliveryKind, EVENT_NOTIFICATION, EVENT_NOTIFICATION_UPDATED, Notification, NotificationStatus, ResponseAction,
    Routine, ScheduleEntry,
};
use nudge_core::{NudgeError, SchedulerConfig};
use nudge_scheduler::{
    DispatchOutcome, Dispatcher, RespondRequest, SchedulerDeps, SchedulerHandle, SqliteStore,
};
use nudge_test_utils::RecordingTransport;

struct Harness {
    handle: SchedulerHandle,
    store: Arc<SqliteStore>,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
}

// 2026-03-02 is a Monday.
fn monday(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
}

/// Pending notifications wait one minute before the sweep dispatches them,
/// so a freshly created notification can be observed as `pending`.
fn harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(ManualClock::new(monday(9, 0)));
    let config = SchedulerConfig {
        pending_grace_secs: 60,
        ..Default::default()
    };
    let deps = SchedulerDeps {
        routines: store.clone(),
        notifications: store.clone(),
        transport: transport.clone(),
        metrics: store.clone(),
        clock: clock.clone(),
    };
    let handle = SchedulerHandle::new(config, deps).unwrap();
    Harness {
        handle,
        store,
        transport,
        clock,
    }
}

fn morning_routine() -> Routine {
    let mut r = Routine::new(
        "r-meds",
        "u1",
        "Morning meds",
        vec![ScheduleEntry::parse("09:00", &[1]).unwrap()],
    );
    r.description = "Take the blue pill".into();
    r
}

impl Harness {
    /// Scan at `at` and return the routine's notifications.
    async fn scan(&self, at: DateTime<Utc>, routine_id: &str) -> Vec<Notification> {
        self.clock.set(at);
        self.handle.run_due_scan(at).await.unwrap();
        self.store.notifications_for_routine(routine_id).unwrap()
    }

    async fn respond(
        &self,
        id: &str,
        action: ResponseAction,
        secs: u32,
        snooze_minutes: Option<u32>,
    ) -> nudge_core::Result<nudge_scheduler::RespondResult> {
        self.handle
            .respond(RespondRequest {
                notification_id: id.to_string(),
                user_id: "u1".into(),
                action,
                response_time_seconds: secs,
                snooze_minutes,
            })
            .await
    }

    async fn offset(&self, routine_id: &str) -> i32 {
        self.store
            .get_routine(routine_id)
            .await
            .unwrap()
            .adaptive_timing
            .offset_minutes
    }
}

#[tokio::test]
async fn scenario_a_due_scan_creates_one_pending_notification() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();

    let created = h.scan(monday(9, 0), "r-meds").await;
    assert_eq!(created.len(), 1);
    let n = &created[0];
    assert_eq!(n.status, NotificationStatus::Pending);
    assert_eq!(n.scheduled_for, monday(9, 0));
    assert_eq!(n.title, "Morning meds");
    assert_eq!(n.message, "Take the blue pill");
    assert_eq!(n.metadata.adaptive_adjustment_applied, 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn scenario_b_snooze_then_redeliver() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    h.scan(monday(9, 0), "r-meds").await;
    let delivered = h.scan(monday(9, 1), "r-meds").await;
    assert_eq!(delivered[0].status, NotificationStatus::Delivered);
    let id = delivered[0].id.clone();

    let snoozed_at = monday(9, 1) + Duration::seconds(12);
    h.clock.set(snoozed_at);
    let res = h.respond(&id, ResponseAction::Snoozed, 12, Some(5)).await.unwrap();
    assert_eq!(res.status, NotificationStatus::Snoozed);
    assert_eq!(res.notification.snoozed_until, Some(snoozed_at + Duration::minutes(5)));

    let early = h.handle.run_snooze_scan(monday(9, 6)).await.unwrap();
    assert_eq!(early.delivered, 0);
    assert_eq!(
        h.store.get_notification(&id).await.unwrap().status,
        NotificationStatus::Snoozed
    );

    h.transport.clear();
    let late = h.handle.run_snooze_scan(monday(9, 6) + Duration::seconds(30)).await.unwrap();
    assert_eq!(late.delivered, 1);
    let stored = h.store.get_notification(&id).await.unwrap();
    assert_eq!(stored.status, NotificationStatus::Delivered);
    assert_eq!(stored.delivery_attempts, 2);
    assert!(stored.snoozed_until.is_none());

    let pushes = h.transport.sent_events(EVENT_NOTIFICATION);
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].payload["type"], "snooze_reminder");
}

#[tokio::test]
async fn scenario_c_fast_completion_pulls_offset_earlier() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);

    h.respond(&n.id, ResponseAction::Completed, 15, None).await.unwrap();
    assert_eq!(h.offset("r-meds").await, -1);

    // Already at the floor.
    let mut floored = morning_routine();
    floored.id = "r-floor".into();
    floored.adaptive_timing.offset_minutes = -15;
    h.handle.schedule_routine(&floored).await.unwrap();
    let n = h.scan(monday(9, 0) + Duration::days(7), "r-floor").await.remove(0);
    h.respond(&n.id, ResponseAction::Completed, 15, None).await.unwrap();
    assert_eq!(h.offset("r-floor").await, -15);
}

#[tokio::test]
async fn scenario_d_second_response_conflicts() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);

    h.respond(&n.id, ResponseAction::Dismissed, 200, None).await.unwrap();
    let err = h.respond(&n.id, ResponseAction::Completed, 5, None).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        h.store.get_notification(&n.id).await.unwrap().status,
        NotificationStatus::Dismissed
    );
}

#[tokio::test]
async fn scenario_e_deactivation_cancels_pending_and_snoozed() {
    let h = harness();
    let mut r = morning_routine();
    r.schedule.push(ScheduleEntry::parse("12:00", &[1]).unwrap());
    h.handle.schedule_routine(&r).await.unwrap();

    let first = h.scan(monday(9, 0), "r-meds").await.remove(0);
    h.scan(monday(9, 1), "r-meds").await;
    h.clock.set(monday(9, 2));
    h.respond(&first.id, ResponseAction::Snoozed, 30, Some(10)).await.unwrap();
    let all = h.scan(monday(12, 0), "r-meds").await;
    assert_eq!(all.len(), 2);

    assert_eq!(h.handle.cancel_routine("r-meds").await.unwrap(), 2);
    for n in h.store.notifications_for_routine("r-meds").unwrap() {
        assert_eq!(n.status, NotificationStatus::Cancelled);
    }
    assert_eq!(h.transport.sent_events(EVENT_NOTIFICATION_UPDATED).len(), 3);

    h.transport.clear();
    let tally = h.handle.run_snooze_scan(monday(13, 0)).await.unwrap();
    assert_eq!(tally.delivered, 0);
    h.handle.run_due_scan(monday(13, 1)).await.unwrap();
    assert!(h.transport.sent_events(EVENT_NOTIFICATION).is_empty());
}

#[tokio::test]
async fn dedup_holds_across_repeated_scans_in_window() {
    let h = harness();
    let mut r = morning_routine();
    r.adaptive_timing.offset_minutes = 15;
    h.handle.schedule_routine(&r).await.unwrap();

    h.scan(monday(9, 0), "r-meds").await;
    h.scan(monday(9, 0) + Duration::seconds(20), "r-meds").await;
    h.scan(monday(9, 0) + Duration::seconds(40), "r-meds").await;
    let all = h.store.notifications_for_routine("r-meds").unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].scheduled_for, monday(9, 15));
}

#[tokio::test]
async fn terminal_statuses_reject_every_response() {
    let h = harness();
    let mut r = morning_routine();
    r.schedule = vec![ScheduleEntry::parse("09:00", &[1, 2, 3, 4]).unwrap()];
    r.adaptive_timing.enabled = false;
    h.handle.schedule_routine(&r).await.unwrap();

    // completed / dismissed
    let completed = h.scan(monday(9, 0), "r-meds").await.remove(0);
    h.respond(&completed.id, ResponseAction::Completed, 40, None).await.unwrap();
    let dismissed = h.scan(monday(9, 0) + Duration::days(1), "r-meds").await;
    let dismissed = dismissed.iter().find(|n| n.id != completed.id).unwrap().clone();
    h.respond(&dismissed.id, ResponseAction::Dismissed, 40, None).await.unwrap();

    // failed
    h.transport.set_failing(true);
    h.scan(monday(9, 0) + Duration::days(2), "r-meds").await;
    let failed = h
        .scan(monday(9, 1) + Duration::days(2), "r-meds")
        .await
        .into_iter()
        .find(|n| n.status == NotificationStatus::Failed)
        .unwrap();
    assert_eq!(failed.delivery_attempts, 1);
    h.transport.set_failing(false);

    // cancelled
    h.scan(monday(9, 0) + Duration::days(3), "r-meds").await;
    h.handle.cancel_routine("r-meds").await.unwrap();
    let cancelled = h
        .store
        .notifications_for_routine("r-meds")
        .unwrap()
        .into_iter()
        .find(|n| n.status == NotificationStatus::Cancelled)
        .unwrap();

    for n in [&completed, &dismissed, &failed, &cancelled] {
        for action in [ResponseAction::Completed, ResponseAction::Dismissed, ResponseAction::Snoozed] {
            let err = h.respond(&n.id, action, 1, None).await.unwrap_err();
            assert!(err.is_conflict(), "{} accepted {action}", n.id);
        }
    }
}

#[tokio::test]
async fn concurrent_responses_have_one_winner() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);

    let (a, b) = futures::join!(
        h.respond(&n.id, ResponseAction::Completed, 10, None),
        h.respond(&n.id, ResponseAction::Dismissed, 10, None),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let (winner, loser) = match (a, b) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        _ => unreachable!(),
    };
    assert!(loser.is_conflict());
    let stored = h.store.get_notification(&n.id).await.unwrap();
    assert_eq!(stored.status, winner.status);
    assert_eq!(stored.user_response, winner.notification.user_response);
    assert!(!stored.processing);
}

#[tokio::test]
async fn offset_stays_clamped_over_many_dismissals() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();

    for week in 0..6 {
        let at = monday(9, 0) + Duration::days(7 * week);
        let n = h
            .scan(at, "r-meds")
            .await
            .into_iter()
            .find(|n| n.status.is_open())
            .unwrap();
        h.respond(&n.id, ResponseAction::Dismissed, 60, None).await.unwrap();
        let offset = h.offset("r-meds").await;
        assert!((-15..=15).contains(&offset));
    }
    assert_eq!(h.offset("r-meds").await, 15);
}

#[tokio::test]
async fn editing_a_routine_keeps_its_learned_offset() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);
    h.respond(&n.id, ResponseAction::Dismissed, 90, None).await.unwrap();
    assert_eq!(h.offset("r-meds").await, 5);

    // The edit carries the default offset of 0 and must not reset the learned one.
    let mut edited = morning_routine();
    edited.title = "Morning meds (with food)".into();
    h.handle.schedule_routine(&edited).await.unwrap();
    let stored = h.store.get_routine("r-meds").await.unwrap();
    assert_eq!(stored.title, "Morning meds (with food)");
    assert_eq!(stored.adaptive_timing.offset_minutes, 5);

    // Toggling off and on keeps it too.
    h.handle.cancel_routine("r-meds").await.unwrap();
    h.handle.schedule_routine(&edited).await.unwrap();
    assert_eq!(h.offset("r-meds").await, 5);

    let next = h.scan(monday(9, 0) + Duration::days(7), "r-meds").await;
    let next = next.iter().find(|n| n.status == NotificationStatus::Pending).unwrap();
    assert_eq!(next.scheduled_for, monday(9, 5) + Duration::days(7));
}

#[tokio::test]
async fn cancelling_between_fetch_and_push_suppresses_delivery() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    h.scan(monday(9, 0), "r-meds").await;
    let fetched = h.store.find_pending_due(monday(9, 1)).await.unwrap();
    assert_eq!(fetched.len(), 1);

    // The batch is stale by the time the dispatcher reaches it.
    h.handle.cancel_routine("r-meds").await.unwrap();
    h.transport.clear();
    let dispatcher = Dispatcher::new(h.store.clone(), h.transport.clone());
    let outcome = dispatcher
        .dispatch(&fetched[0], DeliveryKind::Reminder, monday(9, 1))
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Superseded { .. }));
    assert!(h.transport.sent_events(EVENT_NOTIFICATION).is_empty());
    assert_eq!(
        h.store.get_notification(&fetched[0].id).await.unwrap().status,
        NotificationStatus::Cancelled
    );
}

#[tokio::test]
async fn reactivation_does_not_resurrect_cancelled() {
    let h = harness();
    let r = morning_routine();
    h.handle.schedule_routine(&r).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);

    h.handle.cancel_routine("r-meds").await.unwrap();
    h.handle.cancel_routine("r-meds").await.unwrap();
    h.handle.schedule_routine(&r).await.unwrap();
    assert!(h.store.get_routine("r-meds").await.unwrap().is_active);
    assert_eq!(
        h.store.get_notification(&n.id).await.unwrap().status,
        NotificationStatus::Cancelled
    );

    h.handle.run_snooze_scan(monday(9, 30)).await.unwrap();
    h.handle.run_due_scan(monday(9, 31)).await.unwrap();
    assert!(h.transport.sent_events(EVENT_NOTIFICATION).is_empty());
}

#[tokio::test]
async fn foreign_user_cannot_respond() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);

    let err = h
        .handle
        .respond(RespondRequest {
            notification_id: n.id.clone(),
            user_id: "u2".into(),
            action: ResponseAction::Completed,
            response_time_seconds: 3,
            snooze_minutes: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NudgeError::NotFound(_)));
}

#[tokio::test]
async fn retention_sweep_removes_old_terminal_notifications() {
    let h = harness();
    h.handle.schedule_routine(&morning_routine()).await.unwrap();
    let n = h.scan(monday(9, 0), "r-meds").await.remove(0);
    h.respond(&n.id, ResponseAction::Completed, 50, None).await.unwrap();

    assert_eq!(h.handle.run_retention_sweep(monday(9, 0) + Duration::days(29)).await.unwrap(), 0);
    assert_eq!(h.handle.run_retention_sweep(monday(9, 0) + Duration::days(31)).await.unwrap(), 1);
    assert!(h.store.notifications_for_routine("r-meds").unwrap().is_empty());
}
