//! Notification store wrapper that fails on demand.
//!
//! Every call is forwarded to the wrapped store unless failures are armed,
//! in which case it returns `NudgeError::Store` and consumes one failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{DeliveryOutcome, NotificationMutator, NotificationStore};
use nudge_core::types::{Notification, NotificationStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct FlakyNotificationStore {
    inner: Arc<dyn NotificationStore>,
    failures_left: AtomicUsize,
}

impl FlakyNotificationStore {
    pub fn new(inner: Arc<dyn NotificationStore>) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls, whichever methods they are.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn failures_left(&self) -> usize {
        self.failures_left.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str) -> Result<()> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(NudgeError::Store(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for FlakyNotificationStore {
    async fn create_notification(&self, notification: &Notification) -> Result<String> {
        self.check("create_notification")?;
        self.inner.create_notification(notification).await
    }

    async fn find_duplicate_candidate(
        &self,
        routine_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        self.check("find_duplicate_candidate")?;
        self.inner.find_duplicate_candidate(routine_id, from, to).await
    }

    async fn find_snoozed_due(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        self.check("find_snoozed_due")?;
        self.inner.find_snoozed_due(now).await
    }

    async fn find_pending_due(&self, cutoff: DateTime<Utc>) -> Result<Vec<Notification>> {
        self.check("find_pending_due")?;
        self.inner.find_pending_due(cutoff).await
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        self.check("get_notification")?;
        self.inner.get_notification(id).await
    }

    async fn transactional_update(&self, id: &str, mutator: NotificationMutator) -> Result<Notification> {
        self.check("transactional_update")?;
        self.inner.transactional_update(id, mutator).await
    }

    async fn release_processing(&self, id: &str) -> Result<()> {
        self.check("release_processing")?;
        self.inner.release_processing(id).await
    }

    async fn claim_for_delivery(&self, id: &str) -> Result<Option<Notification>> {
        self.check("claim_for_delivery")?;
        self.inner.claim_for_delivery(id).await
    }

    async fn record_delivery(
        &self,
        id: &str,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        self.check("record_delivery")?;
        self.inner.record_delivery(id, outcome, at).await
    }

    async fn cancel_open_for_routine(&self, routine_id: &str) -> Result<Vec<Notification>> {
        self.check("cancel_open_for_routine")?;
        self.inner.cancel_open_for_routine(routine_id).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[NotificationStatus]) -> Result<usize> {
        self.check("delete_older_than")?;
        self.inner.delete_older_than(cutoff, statuses).await
    }
}
