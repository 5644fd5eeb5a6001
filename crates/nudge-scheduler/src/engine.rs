//! Scheduler engine: owns the periodic scans and the public lifecycle.
//! Each job is a tokio interval loop that sleeps between ticks and stops on
//! a shared watch signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{Clock, MetricsSink, NotificationStore, PushTransport, RoutineStore};
use nudge_core::types::{Routine, clamp_offset};
use nudge_core::SchedulerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dedup::DuplicateSuppressor;
use crate::dispatch::{DispatchTally, Dispatcher};
use crate::factory::NotificationFactory;
use crate::matcher::DueRoutineMatcher;
use crate::pending::PendingSweep;
use crate::response::{RespondRequest, RespondResult, ResponsePolicy, ResponseProcessor};
use crate::retention::RetentionSweeper;
use crate::snooze::SnoozeScanner;

/// Collaborators injected into the scheduler.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub routines: Arc<dyn RoutineStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub transport: Arc<dyn PushTransport>,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub last_scan_at: Option<DateTime<Utc>>,
    #[serde(rename = "activeCronJobs")]
    pub active_jobs: Vec<String>,
}

/// Outcome of one due-routine scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DueScanReport {
    pub matched: usize,
    pub created: usize,
    pub skipped_duplicates: usize,
    pub dispatched: DispatchTally,
}

/// Periodic jobs run by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    DueScan,
    SnoozeScan,
    RetentionSweep,
}

impl Job {
    const ALL: [Job; 3] = [Job::DueScan, Job::SnoozeScan, Job::RetentionSweep];

    fn name(self) -> &'static str {
        match self {
            Job::DueScan => "due-scan",
            Job::SnoozeScan => "snooze-scan",
            Job::RetentionSweep => "retention-sweep",
        }
    }

    fn period(self, config: &SchedulerConfig) -> StdDuration {
        let secs = match self {
            Job::DueScan => config.due_scan_interval_secs,
            Job::SnoozeScan => config.snooze_scan_interval_secs,
            Job::RetentionSweep => config.retention_sweep_interval_secs,
        };
        StdDuration::from_secs(secs)
    }
}

/// Clears a job's busy flag when the run ends, including on early return.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool, job: Job) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(NudgeError::conflict(format!("{} is already running", job.name())));
        }
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    routines: Arc<dyn RoutineStore>,
    notifications: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
    matcher: DueRoutineMatcher,
    dedup: DuplicateSuppressor,
    factory: NotificationFactory,
    dispatcher: Arc<Dispatcher>,
    pending: PendingSweep,
    snooze: SnoozeScanner,
    retention: RetentionSweeper,
    responses: ResponseProcessor,
    last_scan_at: Mutex<Option<DateTime<Utc>>>,
    due_busy: AtomicBool,
    snooze_busy: AtomicBool,
    retention_busy: AtomicBool,
}

impl Inner {
    async fn run_job(&self, job: Job) {
        let now = self.clock.now();
        let result = match job {
            Job::DueScan => self.due_scan(now).await.map(|_| ()),
            Job::SnoozeScan => self.snooze_scan(now).await.map(|_| ()),
            Job::RetentionSweep => self.retention_sweep(now).await.map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                tracing::warn!("⚠️ Skipping {} tick: previous run still in progress", job.name());
            }
            Err(e) => tracing::error!("❌ {} failed: {e}", job.name()),
        }
    }

    async fn due_scan(&self, now: DateTime<Utc>) -> Result<DueScanReport> {
        let _busy = BusyGuard::acquire(&self.due_busy, Job::DueScan)?;
        let (slot, due) = self.matcher.due_at(now).await?;
        let mut report = DueScanReport {
            matched: due.len(),
            ..Default::default()
        };

        for routine in &due {
            match self.dedup.existing(&routine.id, slot.nominal).await {
                Ok(Some(existing)) => {
                    tracing::debug!(
                        "⏭️ Routine '{}' already has open notification {} near {}",
                        routine.title,
                        existing.id,
                        slot.nominal.format("%H:%M")
                    );
                    report.skipped_duplicates += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("❌ Duplicate check for routine {} failed: {e}", routine.id);
                    continue;
                }
            }
            match self.factory.create(routine, slot.nominal, now).await {
                Ok(_) => report.created += 1,
                Err(e) => tracing::error!("❌ Could not create notification for routine {}: {e}", routine.id),
            }
        }

        report.dispatched = self.pending.sweep(now).await?;
        if let Ok(mut last) = self.last_scan_at.lock() {
            *last = Some(now);
        }

        if report.matched == 0 && report.dispatched == DispatchTally::default() {
            tracing::debug!("🕐 Due scan at {}: nothing to do", now.format("%H:%M:%S"));
        } else {
            tracing::info!(
                "🕐 Due scan at {}: {} matched, {} created, {} duplicate(s), {} delivered, {} failed",
                now.format("%H:%M:%S"),
                report.matched,
                report.created,
                report.skipped_duplicates,
                report.dispatched.delivered,
                report.dispatched.failed
            );
        }
        Ok(report)
    }

    async fn snooze_scan(&self, now: DateTime<Utc>) -> Result<DispatchTally> {
        let _busy = BusyGuard::acquire(&self.snooze_busy, Job::SnoozeScan)?;
        self.snooze.scan(now).await
    }

    async fn retention_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let _busy = BusyGuard::acquire(&self.retention_busy, Job::RetentionSweep)?;
        self.retention.sweep(now).await
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    jobs: Vec<(Job, JoinHandle<()>)>,
}

/// The public face of the reminder engine.
pub struct SchedulerHandle {
    config: SchedulerConfig,
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl SchedulerHandle {
    /// Build a stopped scheduler. The config is validated here.
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(deps.notifications.clone(), deps.transport.clone()));
        let inner = Inner {
            matcher: DueRoutineMatcher::new(deps.routines.clone(), config.utc_offset_minutes),
            dedup: DuplicateSuppressor::new(deps.notifications.clone(), config.dedup_window_minutes),
            factory: NotificationFactory::new(deps.notifications.clone()),
            pending: PendingSweep::new(deps.notifications.clone(), dispatcher.clone(), config.pending_grace_secs),
            snooze: SnoozeScanner::new(deps.notifications.clone(), dispatcher.clone()),
            retention: RetentionSweeper::new(deps.notifications.clone(), config.retention_days),
            responses: ResponseProcessor::new(
                deps.notifications.clone(),
                deps.routines.clone(),
                deps.metrics.clone(),
                dispatcher.clone(),
                deps.clock.clone(),
                ResponsePolicy::from(&config),
            ),
            dispatcher,
            routines: deps.routines,
            notifications: deps.notifications,
            clock: deps.clock,
            last_scan_at: Mutex::new(None),
            due_busy: AtomicBool::new(false),
            snooze_busy: AtomicBool::new(false),
            retention_busy: AtomicBool::new(false),
        };
        Ok(Self {
            config,
            inner: Arc::new(inner),
            running: Mutex::new(None),
        })
    }

    /// Spawn the periodic jobs. Must be called inside a tokio runtime.
    /// Calling it while already running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            tracing::debug!("⏰ Scheduler already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let jobs = Job::ALL
            .iter()
            .map(|&job| (job, self.spawn_job(job, shutdown_rx.clone())))
            .collect();
        *running = Some(Running { shutdown_tx, jobs });

        tracing::info!(
            "⏰ Scheduler started (due scan every {}s, snooze scan every {}s, retention every {}s)",
            self.config.due_scan_interval_secs,
            self.config.snooze_scan_interval_secs,
            self.config.retention_sweep_interval_secs
        );
    }

    fn spawn_job(&self, job: Job, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = job.period(&self.config);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => inner.run_job(job).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("🛑 {} stopped", job.name());
        })
    }

    /// Signal every job to stop and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return;
        };
        running.shutdown_tx.send(true).ok();
        for (job, handle) in running.jobs {
            if let Err(e) = handle.await {
                tracing::error!("❌ {} task ended abnormally: {e}", job.name());
            }
        }
        tracing::info!("🛑 Scheduler stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let active_jobs = running
            .as_ref()
            .map(|r| {
                r.jobs
                    .iter()
                    .filter(|(_, handle)| !handle.is_finished())
                    .map(|(job, _)| job.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        SchedulerStatus {
            is_running: running.is_some(),
            last_scan_at: *self.inner.last_scan_at.lock().unwrap_or_else(|e| e.into_inner()),
            active_jobs,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one due-routine scan for the minute containing `now`, then sweep
    /// pending notifications. `Conflict` if a scan is already in progress.
    pub async fn run_due_scan(&self, now: DateTime<Utc>) -> Result<DueScanReport> {
        self.inner.due_scan(now).await
    }

    pub async fn run_snooze_scan(&self, now: DateTime<Utc>) -> Result<DispatchTally> {
        self.inner.snooze_scan(now).await
    }

    /// Returns the number of deleted notifications.
    pub async fn run_retention_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.retention_sweep(now).await
    }

    /// Register or update a routine. An existing routine keeps its learned
    /// adaptive offset. An inactive routine has its open notifications cancelled.
    pub async fn schedule_routine(&self, routine: &Routine) -> Result<()> {
        validate_routine(routine)?;
        let mut routine = routine.clone();
        routine.adaptive_timing.offset_minutes = clamp_offset(routine.adaptive_timing.offset_minutes);
        self.inner.routines.upsert_routine(&routine).await?;
        tracing::info!(
            "📅 Routine '{}' ({}) scheduled with {} entr{}",
            routine.title,
            routine.id,
            routine.schedule.len(),
            if routine.schedule.len() == 1 { "y" } else { "ies" }
        );
        if !routine.is_active {
            self.cancel_open(&routine.id).await?;
        }
        Ok(())
    }

    /// Deactivate a routine and cancel its pending/snoozed notifications.
    /// Returns how many were cancelled.
    pub async fn cancel_routine(&self, routine_id: &str) -> Result<usize> {
        if !self.inner.routines.set_routine_active(routine_id, false).await? {
            return Err(NudgeError::not_found(format!("routine {routine_id}")));
        }
        let cancelled = self.cancel_open(routine_id).await?;
        tracing::info!("🗑️ Routine {routine_id} cancelled ({cancelled} open notification(s))");
        Ok(cancelled)
    }

    async fn cancel_open(&self, routine_id: &str) -> Result<usize> {
        let cancelled = self.inner.notifications.cancel_open_for_routine(routine_id).await?;
        for notification in &cancelled {
            self.inner.dispatcher.sync_update(notification).await;
        }
        Ok(cancelled.len())
    }

    pub async fn respond(&self, req: RespondRequest) -> Result<RespondResult> {
        self.inner.responses.respond(req).await
    }
}

fn validate_routine(routine: &Routine) -> Result<()> {
    if routine.id.trim().is_empty() || routine.user_id.trim().is_empty() {
        return Err(NudgeError::invalid("routine id and user id are required"));
    }
    for entry in &routine.schedule {
        if entry.time >= 24 * 60 {
            return Err(NudgeError::invalid(format!("schedule time {} is out of range", entry.time)));
        }
        if let Some(day) = entry.days.iter().find(|d| **d > 6) {
            return Err(NudgeError::invalid(format!("weekday {day} is out of range 0..=6")));
        }
    }
    if !(0.0..=1.0).contains(&routine.volume) {
        return Err(NudgeError::invalid(format!("volume {} is outside 0..=1", routine.volume)));
    }
    Ok(())
}
