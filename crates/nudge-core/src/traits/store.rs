//! Persistence traits for routines and notifications.
//!
//! Any durable store with an atomic read-modify-write can back these.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Notification, NotificationStatus, Routine};

/// Mutation applied to a notification while its `processing` flag is held.
/// Returning an error aborts the update and releases the flag.
pub type NotificationMutator = Box<dyn FnOnce(&mut Notification) -> Result<()> + Send>;

/// An adaptive offset before and after one adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetAdjustment {
    pub previous: i32,
    pub current: i32,
}

/// Result of one push attempt, recorded by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
}

#[async_trait]
pub trait RoutineStore: Send + Sync {
    /// Active routines with a schedule entry at this minute-of-day and weekday.
    async fn find_active_routines_due_at(&self, minute_of_day: u16, weekday: u8) -> Result<Vec<Routine>>;

    /// Fetch a routine. Absent → `NotFound`.
    async fn get_routine(&self, id: &str) -> Result<Routine>;

    /// Add `delta` to the adaptive offset and clamp it, as one atomic step.
    /// `None` when adaptive timing is disabled for the routine. Only the
    /// scheduler writes this field.
    async fn adjust_adaptive_offset(
        &self,
        id: &str,
        delta: i32,
        adjusted_at: DateTime<Utc>,
    ) -> Result<Option<OffsetAdjustment>>;

    /// Insert a routine, or update an existing one. An existing routine keeps
    /// its stored offset and `last_adjusted_at`.
    async fn upsert_routine(&self, routine: &Routine) -> Result<()>;

    /// Toggle the active flag. Returns false when the routine does not exist.
    async fn set_routine_active(&self, id: &str, active: bool) -> Result<bool>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification(&self, notification: &Notification) -> Result<String>;

    /// An open (pending/delivered/snoozed) notification for the routine
    /// scheduled within `[from, to]`, if any.
    async fn find_duplicate_candidate(
        &self,
        routine_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Notification>>;

    /// Snoozed notifications whose `snoozed_until <= now`.
    async fn find_snoozed_due(&self, now: DateTime<Utc>) -> Result<Vec<Notification>>;

    /// Pending, unlocked notifications whose `scheduled_for <= cutoff`.
    async fn find_pending_due(&self, cutoff: DateTime<Utc>) -> Result<Vec<Notification>>;

    /// Fetch a notification. Absent → `NotFound`.
    async fn get_notification(&self, id: &str) -> Result<Notification>;

    /// Acquire `processing` (false → true), apply `mutator`, commit the result
    /// and release the flag as one unit. A held flag → `Conflict`.
    async fn transactional_update(&self, id: &str, mutator: NotificationMutator) -> Result<Notification>;

    /// Force `processing` back to false.
    async fn release_processing(&self, id: &str) -> Result<()>;

    /// Take the `processing` flag for delivery. Only a pending or snoozed,
    /// unlocked notification can be claimed; otherwise `None`.
    async fn claim_for_delivery(&self, id: &str) -> Result<Option<Notification>>;

    /// Record a push attempt on a claimed notification and release the claim.
    /// Returns `None` when it was cancelled while the push was in flight.
    async fn record_delivery(
        &self,
        id: &str,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>>;

    /// Move every pending/snoozed notification of the routine to `cancelled`.
    async fn cancel_open_for_routine(&self, routine_id: &str) -> Result<Vec<Notification>>;

    /// Delete notifications in `statuses` scheduled before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[NotificationStatus]) -> Result<usize>;
}
