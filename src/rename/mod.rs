//! Propagation of username changes into denormalized author names.
//!
//! Events arrive at least once from a [`RenameEventSource`]; the
//! [`RenameConsumer`] applies each to a [`NameHolderStore`] so that the
//! visible effect is exactly once.

mod consumer;
mod event;

use async_trait::async_trait;
use std::time::Duration;

pub use consumer::{DeliveryOutcome, RenameConsumer};
pub use event::RenameEvent;

/// A claimed, not yet acknowledged event.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub subject_id: String,
    pub payload: String,
    /// Delivery count including this one. Also identifies the claim.
    pub attempts: u32,
}

/// Result of applying one event to the holder tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// Names written; `updated` counts the holder rows touched.
    Applied { updated: u64 },
    /// Older than the newest rename already applied for the subject.
    Stale,
}

/// Records that carry a copy of an author's display name.
#[async_trait]
pub trait NameHolderStore: Send + Sync {
    /// Set every holder of `event.subject_id` to `event.new_display_name` in a
    /// single transaction, unless a newer rename was already applied.
    async fn apply_rename(&self, event: &RenameEvent) -> Result<RenameOutcome, sqlx::Error>;
}

/// At-least-once delivery of rename events.
#[async_trait]
pub trait RenameEventSource: Send + Sync {
    /// Claim the next deliverable event, hiding it from other workers for
    /// `lease`. Events for one subject are handed out in publish order.
    async fn claim(&self, lease: Duration) -> Result<Option<Delivery>, sqlx::Error>;

    // The resolving calls below only act while `delivery` is still the
    // latest claim of its event. They return `false` once the lease expired
    // and another claim took over, leaving the event untouched.

    /// Processing committed; never deliver again.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, sqlx::Error>;

    /// Transient failure; redeliver after `retry_in`.
    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<bool, sqlx::Error>;

    /// Permanent failure; park the event for inspection.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, sqlx::Error>;
}

/// Worker and retry settings for [`RenameConsumer`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Concurrent polling workers
    pub workers: usize,
    /// Deliveries before an event is dead-lettered
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// How long a claimed event stays invisible to other workers
    pub lease: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Delay before redelivering after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}
