//! Domain types: routines, notifications, responses and push payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

use crate::error::{NudgeError, Result};

/// Lower bound of a routine's adaptive delivery offset.
pub const OFFSET_MIN_MINUTES: i32 = -15;
/// Upper bound of a routine's adaptive delivery offset.
pub const OFFSET_MAX_MINUTES: i32 = 15;

/// Push event carrying a freshly delivered notification.
pub const EVENT_NOTIFICATION: &str = "notification";
/// Push event for cross-device sync after a state change.
pub const EVENT_NOTIFICATION_UPDATED: &str = "notification-updated";

/// Clamp an adaptive offset into `[OFFSET_MIN_MINUTES, OFFSET_MAX_MINUTES]`.
pub fn clamp_offset(minutes: i32) -> i32 {
    minutes.clamp(OFFSET_MIN_MINUTES, OFFSET_MAX_MINUTES)
}

// ─── Routines ──────────────────────────────────────────────

/// A user's recurring reminder schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form tag (health, work, ...). Not interpreted by the scheduler.
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
    #[serde(default = "default_sound")]
    pub sound: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "bool_true")]
    pub is_active: bool,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub adaptive_timing: AdaptiveTiming,
    #[serde(default)]
    pub notification_settings: NotificationSettings,
}

fn default_category() -> String { "other".into() }
fn default_sound() -> String { "default".into() }
fn default_volume() -> f32 { 0.7 }
fn default_priority() -> String { "medium".into() }
fn bool_true() -> bool { true }

impl Routine {
    /// Create an active routine with default delivery settings.
    pub fn new(id: &str, user_id: &str, title: &str, schedule: Vec<ScheduleEntry>) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            category: default_category(),
            schedule,
            sound: default_sound(),
            volume: default_volume(),
            is_active: true,
            priority: default_priority(),
            adaptive_timing: AdaptiveTiming::default(),
            notification_settings: NotificationSettings::default(),
        }
    }

    /// Whether any schedule entry fires at this minute-of-day and weekday.
    pub fn fires_at(&self, minute_of_day: u16, weekday: u8) -> bool {
        self.schedule.iter().any(|e| e.matches(minute_of_day, weekday))
    }

    /// Offset to apply to the nominal fire time, zero when adaptive timing is off.
    pub fn effective_offset(&self) -> i32 {
        if self.adaptive_timing.enabled {
            clamp_offset(self.adaptive_timing.offset_minutes)
        } else {
            0
        }
    }
}

/// One time-of-day slot with the weekdays it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Minute of day (0..1440), serialized as "HH:MM".
    #[serde(serialize_with = "ser_hhmm", deserialize_with = "de_hhmm")]
    pub time: u16,
    /// Weekdays, 0 = Sunday .. 6 = Saturday.
    pub days: Vec<u8>,
}

impl ScheduleEntry {
    /// Build an entry from "HH:MM" and a weekday list.
    pub fn parse(time: &str, days: &[u8]) -> Result<Self> {
        let time = parse_hhmm(time)?;
        if let Some(bad) = days.iter().find(|d| **d > 6) {
            return Err(NudgeError::invalid(format!("weekday {bad} out of range 0..=6")));
        }
        Ok(Self { time, days: days.to_vec() })
    }

    pub fn matches(&self, minute_of_day: u16, weekday: u8) -> bool {
        self.time == minute_of_day && self.days.contains(&weekday)
    }
}

fn parse_hhmm(s: &str) -> Result<u16> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| NudgeError::invalid(format!("time '{s}' is not HH:MM")))?;
    let h: u16 = h.trim().parse().map_err(|_| NudgeError::invalid(format!("bad hour in '{s}'")))?;
    let m: u16 = m.trim().parse().map_err(|_| NudgeError::invalid(format!("bad minute in '{s}'")))?;
    if h > 23 || m > 59 {
        return Err(NudgeError::invalid(format!("time '{s}' out of range")));
    }
    Ok(h * 60 + m)
}

fn ser_hhmm<S: Serializer>(time: &u16, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:02}:{:02}", time / 60, time % 60))
}

fn de_hhmm<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u16, D::Error> {
    let raw = String::deserialize(d)?;
    parse_hhmm(&raw).map_err(serde::de::Error::custom)
}

/// Per-routine delivery offset learned from responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveTiming {
    pub enabled: bool,
    /// Always within `[OFFSET_MIN_MINUTES, OFFSET_MAX_MINUTES]`.
    pub offset_minutes: i32,
    pub last_adjusted_at: Option<DateTime<Utc>>,
}

impl Default for AdaptiveTiming {
    fn default() -> Self {
        Self {
            enabled: true,
            offset_minutes: 0,
            last_adjusted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub snooze_duration_minutes: u32,
    pub max_snoozes: u32,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            snooze_duration_minutes: 5,
            max_snoozes: 3,
        }
    }
}

// ─── Notifications ─────────────────────────────────────────

/// Lifecycle state of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Completed,
    Dismissed,
    Snoozed,
    Cancelled,
    Failed,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 7] = [
        NotificationStatus::Pending,
        NotificationStatus::Delivered,
        NotificationStatus::Completed,
        NotificationStatus::Dismissed,
        NotificationStatus::Snoozed,
        NotificationStatus::Cancelled,
        NotificationStatus::Failed,
    ];

    /// Statuses that still count toward duplicate suppression and accept responses.
    pub const OPEN: [NotificationStatus; 3] = [
        NotificationStatus::Pending,
        NotificationStatus::Delivered,
        NotificationStatus::Snoozed,
    ];

    /// Statuses eligible for retention cleanup.
    pub const TERMINAL: [NotificationStatus; 4] = [
        NotificationStatus::Completed,
        NotificationStatus::Dismissed,
        NotificationStatus::Cancelled,
        NotificationStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Dismissed => "dismissed",
            Self::Snoozed => "snoozed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl FromStr for NotificationStatus {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| NudgeError::invalid(format!("unknown status '{s}'")))
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing response to a delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAction {
    Completed,
    Dismissed,
    Snoozed,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Dismissed => "dismissed",
            Self::Snoozed => "snoozed",
        }
    }

    /// Status a notification lands in after this response.
    pub fn target_status(&self) -> NotificationStatus {
        match self {
            Self::Completed => NotificationStatus::Completed,
            Self::Dismissed => NotificationStatus::Dismissed,
            Self::Snoozed => NotificationStatus::Snoozed,
        }
    }
}

impl FromStr for ResponseAction {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "dismissed" => Ok(Self::Dismissed),
            "snoozed" => Ok(Self::Snoozed),
            other => Err(NudgeError::invalid(format!(
                "action '{other}' must be one of completed, dismissed, snoozed"
            ))),
        }
    }
}

impl std::fmt::Display for ResponseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user's first (and only accepted) answer to a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub action: ResponseAction,
    pub response_time_seconds: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMetadata {
    /// Offset in minutes that shifted `scheduled_for` from the nominal fire time.
    pub adaptive_adjustment_applied: i32,
}

/// One reminder instance derived from a routine firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub routine_id: String,
    pub title: String,
    pub message: String,
    pub sound: String,
    pub volume: f32,
    pub status: NotificationStatus,
    pub scheduled_for: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub user_response: Option<UserResponse>,
    pub delivery_attempts: u32,
    pub snooze_count: u32,
    /// Held while a response is being applied.
    pub processing: bool,
    /// Bumped on every committed write.
    pub version: u64,
    pub metadata: NotificationMetadata,
    pub created_at: DateTime<Utc>,
}

// ─── Push payloads ─────────────────────────────────────────

/// Why a notification is being pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// First delivery after a routine fired.
    Reminder,
    /// Re-delivery after a snooze expired.
    SnoozeReminder,
}

/// Wire payload of a dispatched notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub id: String,
    pub title: String,
    pub message: String,
    pub sound: String,
    pub volume: f32,
    pub routine_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: DeliveryKind,
}

impl PushPayload {
    pub fn for_notification(n: &Notification, kind: DeliveryKind, at: DateTime<Utc>) -> Self {
        Self {
            id: n.id.clone(),
            title: n.title.clone(),
            message: n.message.clone(),
            sound: n.sound.clone(),
            volume: n.volume,
            routine_id: n.routine_id.clone(),
            timestamp: at,
            kind,
        }
    }
}

/// Cross-device sync payload for `notification-updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationUpdate {
    pub id: String,
    pub status: NotificationStatus,
    pub user_response: Option<UserResponse>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Notification> for NotificationUpdate {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id.clone(),
            status: n.status,
            user_response: n.user_response.clone(),
            snoozed_until: n.snoozed_until,
            completed_at: n.completed_at,
        }
    }
}
