//! SQLite-backed persistence for routines, notifications and daily response metrics.
//! One connection behind a mutex; every multi-step write runs in a transaction.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{
    DeliveryOutcome, MetricsSink, NotificationMutator, NotificationStore, OffsetAdjustment, RoutineStore,
};
use nudge_core::types::{
    AdaptiveTiming, Notification, NotificationMetadata, NotificationSettings, NotificationStatus,
    ResponseAction, Routine, ScheduleEntry, UserResponse,
};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const ROUTINE_COLUMNS: &str = "id, user_id, title, description, category, schedule, sound, volume, \
     is_active, priority, adaptive_enabled, offset_minutes, last_adjusted_at, \
     snooze_duration_minutes, max_snoozes";

const NOTIFICATION_COLUMNS: &str = "id, user_id, routine_id, title, message, sound, volume, status, \
     scheduled_for, delivered_at, completed_at, snoozed_until, user_response, delivery_attempts, \
     snooze_count, processing, version, adaptive_adjustment, created_at";

/// Daily per-user response counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyMetrics {
    pub completed: u32,
    pub dismissed: u32,
    pub snoozed: u32,
    pub responses: u32,
    pub response_seconds_total: u64,
}

/// SQLite store implementing the routine store, notification store and metrics sink.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| NudgeError::Store(format!("DB open: {e}")))?;
        let store = Self::with_connection(conn)?;
        store.release_stale_flags()?;
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| NudgeError::Store(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS routines (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'other',
                schedule TEXT NOT NULL DEFAULT '[]',       -- JSON array of {time, days}
                sound TEXT NOT NULL DEFAULT 'default',
                volume REAL NOT NULL DEFAULT 0.7,
                is_active INTEGER NOT NULL DEFAULT 1,
                priority TEXT NOT NULL DEFAULT 'medium',
                adaptive_enabled INTEGER NOT NULL DEFAULT 1,
                offset_minutes INTEGER NOT NULL DEFAULT 0,
                last_adjusted_at TEXT,
                snooze_duration_minutes INTEGER NOT NULL DEFAULT 5,
                max_snoozes INTEGER NOT NULL DEFAULT 3,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_routines_active ON routines(is_active);

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                routine_id TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                sound TEXT NOT NULL,
                volume REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_for TEXT NOT NULL,
                delivered_at TEXT,
                completed_at TEXT,
                snoozed_until TEXT,
                user_response TEXT,                         -- JSON {action, responseTimeSeconds, timestamp}
                delivery_attempts INTEGER NOT NULL DEFAULT 0,
                snooze_count INTEGER NOT NULL DEFAULT 0,
                processing INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                adaptive_adjustment INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_routine
                ON notifications(routine_id, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_notifications_status
                ON notifications(status, scheduled_for);

            CREATE TABLE IF NOT EXISTS user_metrics (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,                          -- YYYY-MM-DD (UTC)
                completed INTEGER NOT NULL DEFAULT 0,
                dismissed INTEGER NOT NULL DEFAULT 0,
                snoozed INTEGER NOT NULL DEFAULT 0,
                responses INTEGER NOT NULL DEFAULT 0,
                response_seconds_total INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day)
            );
         ",
            )
            .map_err(|e| NudgeError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// A flag still held at open time belongs to a process that died mid
    /// response or mid push.
    fn release_stale_flags(&self) -> Result<()> {
        let n = self
            .lock()?
            .execute("UPDATE notifications SET processing = 0 WHERE processing = 1", [])
            .map_err(|e| NudgeError::Store(format!("Release stale flags: {e}")))?;
        if n > 0 {
            tracing::warn!("⚠️ Released {n} processing flag(s) left by a previous run");
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NudgeError::Store(format!("connection lock poisoned: {e}")))
    }

    // ─── Routine admin ──────────────────────────────────────

    /// All routines owned by a user, active or not.
    pub fn list_routines_for_user(&self, user_id: &str) -> Result<Vec<Routine>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ROUTINE_COLUMNS} FROM routines WHERE user_id = ?1 ORDER BY title"
            ))
            .map_err(NudgeError::store)?;
        let rows = stmt
            .query_map([user_id], routine_from_row)
            .map_err(NudgeError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(NudgeError::store)
    }

    pub fn routine_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM routines", [], |r| r.get(0))
            .map_err(NudgeError::store)?;
        Ok(n as usize)
    }

    /// Count of pending, delivered and snoozed notifications.
    pub fn open_notification_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE status IN ('pending', 'delivered', 'snoozed')",
                [],
                |r| r.get(0),
            )
            .map_err(NudgeError::store)?;
        Ok(n as usize)
    }

    /// Notifications spawned by a routine, oldest first.
    pub fn notifications_for_routine(&self, routine_id: &str) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE routine_id = ?1 ORDER BY scheduled_for, created_at"
            ))
            .map_err(NudgeError::store)?;
        let rows = stmt
            .query_map([routine_id], notification_from_row)
            .map_err(NudgeError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(NudgeError::store)
    }

    // ─── Metrics ────────────────────────────────────────────

    /// Response counters for a user on a UTC day ("YYYY-MM-DD").
    pub fn daily_metrics(&self, user_id: &str, day: &str) -> Result<Option<DailyMetrics>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT completed, dismissed, snoozed, responses, response_seconds_total
             FROM user_metrics WHERE user_id = ?1 AND day = ?2",
            params![user_id, day],
            |row| {
                Ok(DailyMetrics {
                    completed: row.get(0)?,
                    dismissed: row.get(1)?,
                    snoozed: row.get(2)?,
                    responses: row.get(3)?,
                    response_seconds_total: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .optional()
        .map_err(NudgeError::store)
    }
}

// ─── Row mapping ────────────────────────────────────────────

/// Fixed-width UTC timestamp; sorts lexicographically in SQL.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn routine_from_row(row: &Row<'_>) -> rusqlite::Result<Routine> {
    let schedule_json: String = row.get(5)?;
    let schedule: Vec<ScheduleEntry> =
        serde_json::from_str(&schedule_json).map_err(|e| conversion_err(5, e))?;
    Ok(Routine {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        schedule,
        sound: row.get(6)?,
        volume: row.get::<_, f64>(7)? as f32,
        is_active: row.get::<_, i32>(8)? != 0,
        priority: row.get(9)?,
        adaptive_timing: AdaptiveTiming {
            enabled: row.get::<_, i32>(10)? != 0,
            offset_minutes: row.get(11)?,
            last_adjusted_at: get_opt_ts(row, 12)?,
        },
        notification_settings: NotificationSettings {
            snooze_duration_minutes: row.get(13)?,
            max_snoozes: row.get(14)?,
        },
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let status_raw: String = row.get(7)?;
    let status: NotificationStatus = status_raw.parse().map_err(|e| conversion_err(7, e))?;
    let response_raw: Option<String> = row.get(12)?;
    let user_response: Option<UserResponse> = response_raw
        .map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(12, e)))
        .transpose()?;
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        routine_id: row.get(2)?,
        title: row.get(3)?,
        message: row.get(4)?,
        sound: row.get(5)?,
        volume: row.get::<_, f64>(6)? as f32,
        status,
        scheduled_for: get_ts(row, 8)?,
        delivered_at: get_opt_ts(row, 9)?,
        completed_at: get_opt_ts(row, 10)?,
        snoozed_until: get_opt_ts(row, 11)?,
        user_response,
        delivery_attempts: row.get(13)?,
        snooze_count: row.get(14)?,
        processing: row.get::<_, i32>(15)? != 0,
        version: row.get::<_, i64>(16)? as u64,
        metadata: NotificationMetadata {
            adaptive_adjustment_applied: row.get(17)?,
        },
        created_at: get_ts(row, 18)?,
    })
}

fn load_notification(conn: &Connection, id: &str) -> Result<Option<Notification>> {
    conn.query_row(
        &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
        [id],
        notification_from_row,
    )
    .optional()
    .map_err(NudgeError::store)
}

fn query_notifications(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Notification>> {
    let mut stmt = conn.prepare(sql).map_err(NudgeError::store)?;
    let rows = stmt
        .query_map(args, notification_from_row)
        .map_err(NudgeError::store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(NudgeError::store)
}

fn status_placeholders(statuses: &[NotificationStatus], first: usize) -> String {
    (0..statuses.len())
        .map(|i| format!("?{}", first + i))
        .collect::<Vec<_>>()
        .join(", ")
}

// ─── RoutineStore ───────────────────────────────────────────

#[async_trait]
impl RoutineStore for SqliteStore {
    async fn find_active_routines_due_at(&self, minute_of_day: u16, weekday: u8) -> Result<Vec<Routine>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE is_active = 1"))
            .map_err(NudgeError::store)?;
        let rows = stmt
            .query_map([], routine_from_row)
            .map_err(NudgeError::store)?;
        let mut due = Vec::new();
        for routine in rows {
            let routine = routine.map_err(NudgeError::store)?;
            if routine.fires_at(minute_of_day, weekday) {
                due.push(routine);
            }
        }
        Ok(due)
    }

    async fn get_routine(&self, id: &str) -> Result<Routine> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE id = ?1"),
            [id],
            routine_from_row,
        )
        .optional()
        .map_err(NudgeError::store)?
        .ok_or_else(|| NudgeError::not_found(format!("routine {id}")))
    }

    async fn adjust_adaptive_offset(
        &self,
        id: &str,
        delta: i32,
        adjusted_at: DateTime<Utc>,
    ) -> Result<Option<OffsetAdjustment>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(NudgeError::store)?;
        let (enabled, previous): (i32, i32) = tx
            .query_row(
                "SELECT adaptive_enabled, offset_minutes FROM routines WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(NudgeError::store)?
            .ok_or_else(|| NudgeError::not_found(format!("routine {id}")))?;
        if enabled == 0 {
            return Ok(None);
        }
        let current = nudge_core::clamp_offset(previous.saturating_add(delta));
        tx.execute(
            "UPDATE routines SET offset_minutes = ?2, last_adjusted_at = ?3 WHERE id = ?1",
            params![id, current, ts(adjusted_at)],
        )
        .map_err(|e| NudgeError::Store(format!("Update adaptive timing: {e}")))?;
        tx.commit().map_err(NudgeError::store)?;
        Ok(Some(OffsetAdjustment { previous, current }))
    }

    async fn upsert_routine(&self, routine: &Routine) -> Result<()> {
        let schedule = serde_json::to_string(&routine.schedule)?;
        self.lock()?
            .execute(
                "INSERT INTO routines
                 (id, user_id, title, description, category, schedule, sound, volume, is_active, priority,
                  adaptive_enabled, offset_minutes, last_adjusted_at, snooze_duration_minutes, max_snoozes,
                  updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    title = excluded.title,
                    description = excluded.description,
                    category = excluded.category,
                    schedule = excluded.schedule,
                    sound = excluded.sound,
                    volume = excluded.volume,
                    is_active = excluded.is_active,
                    priority = excluded.priority,
                    adaptive_enabled = excluded.adaptive_enabled,
                    snooze_duration_minutes = excluded.snooze_duration_minutes,
                    max_snoozes = excluded.max_snoozes,
                    updated_at = excluded.updated_at",
                params![
                    routine.id,
                    routine.user_id,
                    routine.title,
                    routine.description,
                    routine.category,
                    schedule,
                    routine.sound,
                    f64::from(routine.volume),
                    routine.is_active as i32,
                    routine.priority,
                    routine.adaptive_timing.enabled as i32,
                    nudge_core::clamp_offset(routine.adaptive_timing.offset_minutes),
                    routine.adaptive_timing.last_adjusted_at.map(ts),
                    routine.notification_settings.snooze_duration_minutes,
                    routine.notification_settings.max_snoozes,
                    ts(Utc::now()),
                ],
            )
            .map_err(|e| NudgeError::Store(format!("Save routine: {e}")))?;
        Ok(())
    }

    async fn set_routine_active(&self, id: &str, active: bool) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "UPDATE routines SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active as i32, ts(Utc::now())],
            )
            .map_err(|e| NudgeError::Store(format!("Toggle routine: {e}")))?;
        Ok(n > 0)
    }
}

// ─── NotificationStore ──────────────────────────────────────

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn create_notification(&self, n: &Notification) -> Result<String> {
        let response = n.user_response.as_ref().map(serde_json::to_string).transpose()?;
        self.lock()?
            .execute(
                &format!(
                    "INSERT INTO notifications ({NOTIFICATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    n.id,
                    n.user_id,
                    n.routine_id,
                    n.title,
                    n.message,
                    n.sound,
                    f64::from(n.volume),
                    n.status.as_str(),
                    ts(n.scheduled_for),
                    n.delivered_at.map(ts),
                    n.completed_at.map(ts),
                    n.snoozed_until.map(ts),
                    response,
                    n.delivery_attempts,
                    n.snooze_count,
                    n.processing as i32,
                    n.version as i64,
                    n.metadata.adaptive_adjustment_applied,
                    ts(n.created_at),
                ],
            )
            .map_err(|e| NudgeError::Store(format!("Create notification: {e}")))?;
        Ok(n.id.clone())
    }

    async fn find_duplicate_candidate(
        &self,
        routine_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        let found = query_notifications(
            &conn,
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE routine_id = ?1 AND scheduled_for >= ?2 AND scheduled_for <= ?3
                   AND status IN ('pending', 'delivered', 'snoozed')
                 ORDER BY scheduled_for LIMIT 1"
            ),
            &[&routine_id, &ts(from), &ts(to)],
        )?;
        Ok(found.into_iter().next())
    }

    async fn find_snoozed_due(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        query_notifications(
            &conn,
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE status = 'snoozed' AND processing = 0 AND snoozed_until <= ?1
                 ORDER BY snoozed_until"
            ),
            &[&ts(now)],
        )
    }

    async fn find_pending_due(&self, cutoff: DateTime<Utc>) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        query_notifications(
            &conn,
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE status = 'pending' AND processing = 0 AND scheduled_for <= ?1
                 ORDER BY scheduled_for"
            ),
            &[&ts(cutoff)],
        )
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        let conn = self.lock()?;
        load_notification(&conn, id)?.ok_or_else(|| NudgeError::not_found(format!("notification {id}")))
    }

    async fn transactional_update(&self, id: &str, mutator: NotificationMutator) -> Result<Notification> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(NudgeError::store)?;

        let acquired = tx
            .execute(
                "UPDATE notifications SET processing = 1 WHERE id = ?1 AND processing = 0",
                [id],
            )
            .map_err(NudgeError::store)?;
        if acquired == 0 {
            // Dropping `tx` rolls back; nothing was written.
            return match load_notification(&tx, id)? {
                Some(_) => Err(NudgeError::conflict(format!("notification {id} is already being processed"))),
                None => Err(NudgeError::not_found(format!("notification {id}"))),
            };
        }

        let mut current = load_notification(&tx, id)?
            .ok_or_else(|| NudgeError::not_found(format!("notification {id}")))?;
        let expected_version = current.version;

        // A failing mutator drops `tx`, which also rolls the flag back to 0.
        mutator(&mut current)?;

        current.processing = false;
        current.version = expected_version + 1;
        let response = current.user_response.as_ref().map(serde_json::to_string).transpose()?;
        let written = tx
            .execute(
                "UPDATE notifications SET
                    status = ?3, delivered_at = ?4, completed_at = ?5, snoozed_until = ?6,
                    user_response = ?7, delivery_attempts = ?8, snooze_count = ?9,
                    processing = 0, version = ?10
                 WHERE id = ?1 AND version = ?2",
                params![
                    id,
                    expected_version as i64,
                    current.status.as_str(),
                    current.delivered_at.map(ts),
                    current.completed_at.map(ts),
                    current.snoozed_until.map(ts),
                    response,
                    current.delivery_attempts,
                    current.snooze_count,
                    current.version as i64,
                ],
            )
            .map_err(NudgeError::store)?;
        if written == 0 {
            return Err(NudgeError::conflict(format!("notification {id} changed during update")));
        }
        tx.commit().map_err(NudgeError::store)?;
        Ok(current)
    }

    async fn release_processing(&self, id: &str) -> Result<()> {
        self.lock()?
            .execute("UPDATE notifications SET processing = 0 WHERE id = ?1", [id])
            .map_err(|e| NudgeError::Store(format!("Release processing flag: {e}")))?;
        Ok(())
    }

    async fn claim_for_delivery(&self, id: &str) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        let claimed = conn
            .execute(
                "UPDATE notifications SET processing = 1
                 WHERE id = ?1 AND processing = 0 AND status IN ('pending', 'snoozed')",
                [id],
            )
            .map_err(|e| NudgeError::Store(format!("Claim notification: {e}")))?;
        if claimed == 0 {
            return Ok(None);
        }
        load_notification(&conn, id)
    }

    async fn record_delivery(
        &self,
        id: &str,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        let n = match outcome {
            DeliveryOutcome::Delivered => conn.execute(
                "UPDATE notifications SET status = 'delivered', delivered_at = ?2, snoozed_until = NULL,
                    delivery_attempts = delivery_attempts + 1, processing = 0, version = version + 1
                 WHERE id = ?1 AND processing = 1 AND status IN ('pending', 'snoozed')",
                params![id, ts(at)],
            ),
            DeliveryOutcome::Failed => conn.execute(
                "UPDATE notifications SET status = 'failed',
                    delivery_attempts = delivery_attempts + 1, processing = 0, version = version + 1
                 WHERE id = ?1 AND processing = 1 AND status IN ('pending', 'snoozed')",
                [id],
            ),
        }
        .map_err(|e| NudgeError::Store(format!("Record delivery: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        load_notification(&conn, id)
    }

    async fn cancel_open_for_routine(&self, routine_id: &str) -> Result<Vec<Notification>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(NudgeError::store)?;
        let mut open = query_notifications(
            &tx,
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE routine_id = ?1 AND status IN ('pending', 'snoozed')"
            ),
            &[&routine_id],
        )?;
        tx.execute(
            "UPDATE notifications SET status = 'cancelled', processing = 0, version = version + 1
             WHERE routine_id = ?1 AND status IN ('pending', 'snoozed')",
            [routine_id],
        )
        .map_err(|e| NudgeError::Store(format!("Cancel notifications: {e}")))?;
        tx.commit().map_err(NudgeError::store)?;
        for n in open.iter_mut() {
            n.status = NotificationStatus::Cancelled;
            n.processing = false;
            n.version += 1;
        }
        Ok(open)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[NotificationStatus]) -> Result<usize> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM notifications WHERE scheduled_for < ?1 AND status IN ({})",
            status_placeholders(statuses, 2)
        );
        let mut args: Vec<String> = vec![ts(cutoff)];
        args.extend(statuses.iter().map(|s| s.as_str().to_string()));
        let n = self
            .lock()?
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(|e| NudgeError::Store(format!("Delete notifications: {e}")))?;
        Ok(n)
    }
}

// ─── MetricsSink ────────────────────────────────────────────

#[async_trait]
impl MetricsSink for SqliteStore {
    async fn record_response(
        &self,
        user_id: &str,
        action: ResponseAction,
        response_time_seconds: u32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (completed, dismissed, snoozed) = match action {
            ResponseAction::Completed => (1, 0, 0),
            ResponseAction::Dismissed => (0, 1, 0),
            ResponseAction::Snoozed => (0, 0, 1),
        };
        self.lock()?
            .execute(
                "INSERT INTO user_metrics
                 (user_id, day, completed, dismissed, snoozed, responses, response_seconds_total)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                 ON CONFLICT(user_id, day) DO UPDATE SET
                    completed = completed + excluded.completed,
                    dismissed = dismissed + excluded.dismissed,
                    snoozed = snoozed + excluded.snoozed,
                    responses = responses + 1,
                    response_seconds_total = response_seconds_total + excluded.response_seconds_total",
                params![
                    user_id,
                    at.format("%Y-%m-%d").to_string(),
                    completed,
                    dismissed,
                    snoozed,
                    i64::from(response_time_seconds),
                ],
            )
            .map_err(|e| NudgeError::Store(format!("Record metrics: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn routine(id: &str) -> Routine {
        Routine::new(id, "u1", "Stretch", vec![ScheduleEntry::parse("09:00", &[1]).unwrap()])
    }

    fn notification(id: &str, routine_id: &str, scheduled_for: DateTime<Utc>) -> Notification {
        Notification {
            id: id.into(),
            user_id: "u1".into(),
            routine_id: routine_id.into(),
            title: "Stretch".into(),
            message: "Time to stretch".into(),
            sound: "default".into(),
            volume: 0.7,
            status: NotificationStatus::Pending,
            scheduled_for,
            delivered_at: None,
            completed_at: None,
            snoozed_until: None,
            user_response: None,
            delivery_attempts: 0,
            snooze_count: 0,
            processing: false,
            version: 0,
            metadata: NotificationMetadata::default(),
            created_at: scheduled_for,
        }
    }

    #[tokio::test]
    async fn test_routine_roundtrip_and_due_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut r = routine("r1");
        r.adaptive_timing.offset_minutes = 40;
        store.upsert_routine(&r).await.unwrap();

        let loaded = store.get_routine("r1").await.unwrap();
        assert_eq!(loaded.schedule, r.schedule);
        assert_eq!(loaded.adaptive_timing.offset_minutes, 15, "offset clamped on write");

        assert_eq!(store.find_active_routines_due_at(540, 1).await.unwrap().len(), 1);
        assert!(store.find_active_routines_due_at(540, 2).await.unwrap().is_empty());

        assert!(store.set_routine_active("r1", false).await.unwrap());
        assert!(store.find_active_routines_due_at(540, 1).await.unwrap().is_empty());
        assert!(!store.set_routine_active("missing", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_records_are_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(store.get_routine("nope").await, Err(NudgeError::NotFound(_))));
        assert!(matches!(store.get_notification("nope").await, Err(NudgeError::NotFound(_))));
        let res = store.transactional_update("nope", Box::new(|_| Ok(()))).await;
        assert!(matches!(res, Err(NudgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_candidate_window_and_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_notification(&notification("n1", "r1", at(9, 10))).await.unwrap();

        let hit = store
            .find_duplicate_candidate("r1", at(8, 40), at(9, 20))
            .await
            .unwrap();
        assert_eq!(hit.map(|n| n.id), Some("n1".to_string()));
        assert!(store.find_duplicate_candidate("r1", at(9, 11), at(9, 30)).await.unwrap().is_none());
        assert!(store.find_duplicate_candidate("r2", at(8, 40), at(9, 20)).await.unwrap().is_none());

        store.cancel_open_for_routine("r1").await.unwrap();
        assert!(store.find_duplicate_candidate("r1", at(8, 40), at(9, 20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transactional_update_commits_and_releases() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_notification(&notification("n1", "r1", at(9, 0))).await.unwrap();

        let updated = store
            .transactional_update(
                "n1",
                Box::new(|n| {
                    assert!(n.processing, "flag held while mutating");
                    n.status = NotificationStatus::Dismissed;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, NotificationStatus::Dismissed);
        assert_eq!(updated.version, 1);

        let stored = store.get_notification("n1").await.unwrap();
        assert!(!stored.processing);
        assert_eq!(stored.status, NotificationStatus::Dismissed);
    }

    #[tokio::test]
    async fn test_failed_mutator_rolls_back_flag() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_notification(&notification("n1", "r1", at(9, 0))).await.unwrap();

        let res = store
            .transactional_update(
                "n1",
                Box::new(|n| {
                    n.status = NotificationStatus::Completed;
                    Err(NudgeError::invalid("rejected"))
                }),
            )
            .await;
        assert!(matches!(res, Err(NudgeError::InvalidArgument(_))));

        let stored = store.get_notification("n1").await.unwrap();
        assert!(!stored.processing);
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_held_flag_is_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut n = notification("n1", "r1", at(9, 0));
        n.processing = true;
        store.create_notification(&n).await.unwrap();

        let res = store.transactional_update("n1", Box::new(|_| Ok(()))).await;
        assert!(matches!(res, Err(NudgeError::Conflict(_))));

        store.release_processing("n1").await.unwrap();
        assert!(store.transactional_update("n1", Box::new(|_| Ok(()))).await.is_ok());
    }

    #[tokio::test]
    async fn test_record_delivery_requires_claim() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_notification(&notification("n1", "r1", at(9, 0))).await.unwrap();

        // Unclaimed: nothing to record.
        assert!(store
            .record_delivery("n1", DeliveryOutcome::Delivered, at(9, 0))
            .await
            .unwrap()
            .is_none());

        let claimed = store.claim_for_delivery("n1").await.unwrap().unwrap();
        assert!(claimed.processing);
        assert!(store.claim_for_delivery("n1").await.unwrap().is_none(), "claim is exclusive");

        let delivered = store
            .record_delivery("n1", DeliveryOutcome::Delivered, at(9, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, NotificationStatus::Delivered);
        assert_eq!(delivered.delivered_at, Some(at(9, 0)));
        assert_eq!(delivered.delivery_attempts, 1);
        assert!(!delivered.processing);

        // Delivered notifications cannot be claimed again.
        assert!(store.claim_for_delivery("n1").await.unwrap().is_none());

        store.create_notification(&notification("n2", "r1", at(10, 0))).await.unwrap();
        store.claim_for_delivery("n2").await.unwrap().unwrap();
        let failed = store
            .record_delivery("n2", DeliveryOutcome::Failed, at(10, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, NotificationStatus::Failed);
        assert_eq!(failed.delivery_attempts, 1);
        assert!(failed.delivered_at.is_none());
        assert!(!failed.processing);
    }

    #[tokio::test]
    async fn test_claim_blocks_responses_and_cancel_supersedes_it() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_notification(&notification("n1", "r1", at(9, 0))).await.unwrap();
        store.claim_for_delivery("n1").await.unwrap().unwrap();

        let res = store.transactional_update("n1", Box::new(|_| Ok(()))).await;
        assert!(matches!(res, Err(NudgeError::Conflict(_))));

        assert_eq!(store.cancel_open_for_routine("r1").await.unwrap().len(), 1);
        assert!(store
            .record_delivery("n1", DeliveryOutcome::Delivered, at(9, 0))
            .await
            .unwrap()
            .is_none());
        let stored = store.get_notification("n1").await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Cancelled);
        assert_eq!(stored.delivery_attempts, 0);
        assert!(!stored.processing);
    }

    #[tokio::test]
    async fn test_upsert_keeps_learned_offset() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_routine(&routine("r1")).await.unwrap();
        let adjusted = store.adjust_adaptive_offset("r1", 5, at(9, 1)).await.unwrap().unwrap();
        assert_eq!(adjusted, OffsetAdjustment { previous: 0, current: 5 });

        let mut edited = routine("r1");
        edited.title = "Stretch twice".into();
        edited.notification_settings.max_snoozes = 1;
        store.upsert_routine(&edited).await.unwrap();

        let loaded = store.get_routine("r1").await.unwrap();
        assert_eq!(loaded.title, "Stretch twice");
        assert_eq!(loaded.notification_settings.max_snoozes, 1);
        assert_eq!(loaded.adaptive_timing.offset_minutes, 5);
        assert_eq!(loaded.adaptive_timing.last_adjusted_at, Some(at(9, 1)));
    }

    #[tokio::test]
    async fn test_adjust_offset_clamps_and_respects_disabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_routine(&routine("r1")).await.unwrap();
        store.adjust_adaptive_offset("r1", 12, at(9, 0)).await.unwrap();
        let adjusted = store.adjust_adaptive_offset("r1", 5, at(9, 1)).await.unwrap().unwrap();
        assert_eq!(adjusted, OffsetAdjustment { previous: 12, current: 15 });

        let mut disabled = routine("r2");
        disabled.adaptive_timing.enabled = false;
        store.upsert_routine(&disabled).await.unwrap();
        assert!(store.adjust_adaptive_offset("r2", 5, at(9, 0)).await.unwrap().is_none());
        assert_eq!(store.get_routine("r2").await.unwrap().adaptive_timing.offset_minutes, 0);

        assert!(matches!(
            store.adjust_adaptive_offset("missing", 1, at(9, 0)).await,
            Err(NudgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reopen_releases_stale_flags() {
        let dir = std::env::temp_dir().join(format!("nudge-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nudge.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_notification(&notification("n1", "r1", at(9, 0))).await.unwrap();
            store.claim_for_delivery("n1").await.unwrap().unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(!store.get_notification("n1").await.unwrap().processing);
        drop(store);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_snoozed_and_pending_due_queries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut snoozed = notification("s1", "r1", at(9, 0));
        snoozed.status = NotificationStatus::Snoozed;
        snoozed.snoozed_until = Some(at(9, 5));
        store.create_notification(&snoozed).await.unwrap();
        store.create_notification(&notification("p1", "r2", at(9, 10))).await.unwrap();

        assert!(store.find_snoozed_due(at(9, 4)).await.unwrap().is_empty());
        assert_eq!(store.find_snoozed_due(at(9, 5)).await.unwrap().len(), 1);
        assert!(store.find_pending_due(at(9, 9)).await.unwrap().is_empty());
        assert_eq!(store.find_pending_due(at(9, 10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_older_than_only_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = at(9, 0) - Duration::days(40);
        let mut done = notification("old-done", "r1", old);
        done.status = NotificationStatus::Completed;
        store.create_notification(&done).await.unwrap();
        store.create_notification(&notification("old-pending", "r1", old)).await.unwrap();
        let mut recent = notification("new-done", "r1", at(9, 0));
        recent.status = NotificationStatus::Dismissed;
        store.create_notification(&recent).await.unwrap();

        let deleted = store
            .delete_older_than(at(9, 0) - Duration::days(30), &NotificationStatus::TERMINAL)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_notification("old-pending").await.is_ok());
        assert!(store.get_notification("new-done").await.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_accumulate_per_day() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.record_response("u1", ResponseAction::Completed, 12, at(9, 0)).await.unwrap();
        store.record_response("u1", ResponseAction::Snoozed, 30, at(10, 0)).await.unwrap();
        store
            .record_response("u1", ResponseAction::Dismissed, 5, at(9, 0) + Duration::days(1))
            .await
            .unwrap();

        let day = store.daily_metrics("u1", "2026-03-02").unwrap().unwrap();
        assert_eq!(day.completed, 1);
        assert_eq!(day.snoozed, 1);
        assert_eq!(day.dismissed, 0);
        assert_eq!(day.responses, 2);
        assert_eq!(day.response_seconds_total, 42);
        assert!(store.daily_metrics("u2", "2026-03-02").unwrap().is_none());
    }
}
