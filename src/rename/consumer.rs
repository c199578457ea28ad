use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ConsumerConfig, Delivery, NameHolderStore, RenameEvent, RenameEventSource, RenameOutcome};

/// What happened to one claimed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Applied { updated: u64 },
    /// Dropped by the timestamp guard and acknowledged.
    Stale,
    /// Negatively acknowledged; redelivered after `retry_in`.
    Retrying { attempt: u32, retry_in: Duration },
    DeadLettered,
    /// The lease expired and a newer claim owns the event; nothing recorded.
    LeaseLost,
}

/// Polls a [`RenameEventSource`] and applies events to a [`NameHolderStore`].
pub struct RenameConsumer {
    source: Arc<dyn RenameEventSource>,
    holders: Arc<dyn NameHolderStore>,
    config: ConsumerConfig,
}

impl RenameConsumer {
    pub fn new(
        source: Arc<dyn RenameEventSource>,
        holders: Arc<dyn NameHolderStore>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            holders,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Claim and handle a single delivery. `None` when nothing is claimable.
    pub async fn process_next(&self) -> Result<Option<DeliveryOutcome>, sqlx::Error> {
        let Some(delivery) = self.source.claim(self.config.lease).await? else {
            return Ok(None);
        };
        self.handle(delivery).await.map(Some)
    }

    async fn handle(&self, delivery: Delivery) -> Result<DeliveryOutcome, sqlx::Error> {
        let event = match RenameEvent::from_json(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                // Redelivery cannot fix a payload that does not parse
                let reason = format!("Malformed payload: {}", e);
                return self.dead_letter(&delivery, &reason).await;
            }
        };

        match self.holders.apply_rename(&event).await {
            Ok(RenameOutcome::Applied { updated }) => {
                if !self.source.ack(&delivery).await? {
                    return Ok(self.lease_lost(&delivery, "ack"));
                }
                debug!(
                    event_id = delivery.id,
                    subject_id = %event.subject_id,
                    updated,
                    "Applied rename event"
                );
                Ok(DeliveryOutcome::Applied { updated })
            }
            Ok(RenameOutcome::Stale) => {
                if !self.source.ack(&delivery).await? {
                    return Ok(self.lease_lost(&delivery, "ack"));
                }
                info!(
                    event_id = delivery.id,
                    subject_id = %event.subject_id,
                    timestamp = %event.timestamp,
                    "Dropped stale rename event"
                );
                Ok(DeliveryOutcome::Stale)
            }
            Err(e) if delivery.attempts >= self.config.max_attempts => {
                let reason = format!(
                    "Failed after {} attempts: {}",
                    delivery.attempts, e
                );
                self.dead_letter(&delivery, &reason).await
            }
            Err(e) => {
                let retry_in = self.config.backoff(delivery.attempts);
                if !self
                    .source
                    .nack(&delivery, retry_in, &e.to_string())
                    .await?
                {
                    return Ok(self.lease_lost(&delivery, "nack"));
                }
                warn!(
                    event_id = delivery.id,
                    subject_id = %delivery.subject_id,
                    attempt = delivery.attempts,
                    retry_in_ms = retry_in.as_millis() as u64,
                    error = %e,
                    "Rename event failed, scheduling retry"
                );
                Ok(DeliveryOutcome::Retrying {
                    attempt: delivery.attempts,
                    retry_in,
                })
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<DeliveryOutcome, sqlx::Error> {
        if !self.source.dead_letter(delivery, reason).await? {
            return Ok(self.lease_lost(delivery, "dead-letter"));
        }
        error!(
            target: "dead_letter",
            event_id = delivery.id,
            subject_id = %delivery.subject_id,
            attempts = delivery.attempts,
            reason = %reason,
            "Rename event dead-lettered"
        );
        Ok(DeliveryOutcome::DeadLettered)
    }

    fn lease_lost(&self, delivery: &Delivery, action: &str) -> DeliveryOutcome {
        warn!(
            event_id = delivery.id,
            subject_id = %delivery.subject_id,
            attempt = delivery.attempts,
            action,
            "Lease on rename event expired before it was resolved"
        );
        DeliveryOutcome::LeaseLost
    }

    /// Poll until `shutdown` turns true or its sender is dropped.
    ///
    /// Drains the queue without sleeping while deliveries keep coming.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "Rename consumer poll failed"),
            }

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!("Rename consumer worker stopped");
    }

    /// Start `config.workers` polling tasks sharing this consumer.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        info!(workers, "Starting rename consumer");
        (0..workers)
            .map(|_| {
                let consumer = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { consumer.run(shutdown).await })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(subject: &str, new_name: &str, secs: i64) -> RenameEvent {
        RenameEvent {
            subject_id: subject.into(),
            old_display_name: "old".into(),
            new_display_name: new_name.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            workers: 1,
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            lease: Duration::from_secs(30),
        }
    }

    fn consumer(db: &Database, holders: Arc<dyn NameHolderStore>) -> RenameConsumer {
        RenameConsumer::new(Arc::new(db.rename_queue()), holders, fast_config())
    }

    /// Fails the first `failures` calls, then delegates.
    struct FlakyHolders {
        inner: Arc<dyn NameHolderStore>,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NameHolderStore for FlakyHolders {
        async fn apply_rename(&self, event: &RenameEvent) -> Result<RenameOutcome, sqlx::Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(sqlx::Error::PoolTimedOut);
            }
            self.inner.apply_rename(event).await
        }
    }

    async fn seed_author(db: &Database, author: &str, name: &str) -> (String, String) {
        let poem = db
            .content()
            .create_poem(author, name, "Ode", "body")
            .await
            .unwrap();
        let comment = db
            .content()
            .create_comment(poem.id, author, name, "nice")
            .await
            .unwrap();
        (poem.uuid, comment.uuid)
    }

    #[tokio::test]
    async fn test_applies_to_all_holders_of_subject_only() {
        let db = Database::open(":memory:").await.unwrap();
        let (poem_a, comment_b) = seed_author(&db, "U1", "old").await;
        let (poem_other, _) = seed_author(&db, "U2", "someone").await;

        db.rename_queue()
            .publish(&event("U1", "new", 100))
            .await
            .unwrap();
        let consumer = consumer(&db, Arc::new(db.content()));

        let outcome = consumer.process_next().await.unwrap();
        assert_eq!(outcome, Some(DeliveryOutcome::Applied { updated: 2 }));
        assert_eq!(consumer.process_next().await.unwrap(), None);

        let content = db.content();
        assert_eq!(content.get_poem(&poem_a).await.unwrap().unwrap().author_name, "new");
        assert_eq!(content.get_comment(&comment_b).await.unwrap().unwrap().author_name, "new");
        assert_eq!(
            content.get_poem(&poem_other).await.unwrap().unwrap().author_name,
            "someone"
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        let (poem, _) = seed_author(&db, "U1", "old").await;
        let consumer = consumer(&db, Arc::new(db.content()));

        let e = event("U1", "new", 100);
        db.rename_queue().publish(&e).await.unwrap();
        db.rename_queue().publish(&e).await.unwrap();

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Applied { .. })
        ));
        // Same timestamp again: reapplied, same result
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Applied { .. })
        ));

        let poem = db.content().get_poem(&poem).await.unwrap().unwrap();
        assert_eq!(poem.author_name, "new");
        assert_eq!(db.rename_queue().count_by_status("done").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_older_event_after_newer_is_dropped() {
        let db = Database::open(":memory:").await.unwrap();
        let (poem, _) = seed_author(&db, "U1", "Robert").await;
        let consumer = consumer(&db, Arc::new(db.content()));

        db.rename_queue()
            .publish(&event("U1", "Bob", 10))
            .await
            .unwrap();
        db.rename_queue()
            .publish(&event("U1", "Bobby", 5))
            .await
            .unwrap();

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Applied { .. })
        ));
        assert_eq!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Stale)
        );

        let poem = db.content().get_poem(&poem).await.unwrap().unwrap();
        assert_eq!(poem.author_name, "Bob");
        assert_eq!(db.rename_queue().count_by_status("done").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let db = Database::open(":memory:").await.unwrap();
        let (poem, _) = seed_author(&db, "U1", "old").await;
        let holders = Arc::new(FlakyHolders {
            inner: Arc::new(db.content()),
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let consumer = consumer(&db, holders);

        db.rename_queue()
            .publish(&event("U1", "new", 100))
            .await
            .unwrap();

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Retrying { attempt: 1, .. })
        ));
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Retrying { attempt: 2, .. })
        ));
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::Applied { updated: 2 })
        ));

        let poem = db.content().get_poem(&poem).await.unwrap().unwrap();
        assert_eq!(poem.author_name, "new");
    }

    #[tokio::test]
    async fn test_exhausted_event_is_dead_lettered() {
        let db = Database::open(":memory:").await.unwrap();
        let (poem, _) = seed_author(&db, "U1", "old").await;
        let holders = Arc::new(FlakyHolders {
            inner: Arc::new(db.content()),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let consumer = consumer(&db, holders);

        db.rename_queue()
            .publish(&event("U1", "new", 100))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        while let Some(outcome) = consumer.process_next().await.unwrap() {
            outcomes.push(outcome);
        }
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2], DeliveryOutcome::DeadLettered);

        let dead = db.rename_queue().dead_lettered().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].subject_id, "U1");
        assert_eq!(dead[0].attempts, 3);
        assert!(dead[0].reason.contains("3 attempts"));

        let poem = db.content().get_poem(&poem).await.unwrap().unwrap();
        assert_eq!(poem.author_name, "old");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered_immediately() {
        let db = Database::open(":memory:").await.unwrap();
        db.rename_queue()
            .publish_raw("U1", "{\"subjectId\":\"U1\"}")
            .await
            .unwrap();
        let consumer = consumer(&db, Arc::new(db.content()));

        assert_eq!(
            consumer.process_next().await.unwrap(),
            Some(DeliveryOutcome::DeadLettered)
        );
        let dead = db.rename_queue().dead_lettered().await.unwrap();
        assert_eq!(dead[0].attempts, 1);
        assert!(dead[0].reason.starts_with("Malformed payload"));
    }

    #[tokio::test]
    async fn test_expired_lease_does_not_record_outcome() {
        let db = Database::open(":memory:").await.unwrap();
        let (poem, _) = seed_author(&db, "U1", "old").await;
        db.rename_queue()
            .publish(&event("U1", "new", 100))
            .await
            .unwrap();
        let consumer = consumer(&db, Arc::new(db.content()));

        // A worker whose lease ran out, and the worker that reclaimed the event
        let expired = db.rename_queue().claim(Duration::ZERO).await.unwrap().unwrap();
        let current = db.rename_queue().claim(Duration::from_secs(30)).await.unwrap().unwrap();

        assert_eq!(
            consumer.dead_letter(&expired, "gave up").await.unwrap(),
            DeliveryOutcome::LeaseLost
        );
        assert_eq!(
            consumer.handle(current).await.unwrap(),
            DeliveryOutcome::Applied { updated: 2 }
        );
        assert_eq!(
            consumer.handle(expired).await.unwrap(),
            DeliveryOutcome::LeaseLost
        );

        assert_eq!(db.rename_queue().count_by_status("done").await.unwrap(), 1);
        assert!(db.rename_queue().dead_lettered().await.unwrap().is_empty());
        let poem = db.content().get_poem(&poem).await.unwrap().unwrap();
        assert_eq!(poem.author_name, "new");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_drain_queue_and_stop_on_shutdown() {
        let db = Database::open(":memory:").await.unwrap();
        let mut poems = Vec::new();
        for i in 0..5 {
            let subject = format!("U{}", i);
            let (poem, _) = seed_author(&db, &subject, "old").await;
            db.rename_queue()
                .publish(&event(&subject, "first", 10))
                .await
                .unwrap();
            db.rename_queue()
                .publish(&event(&subject, &format!("final-{}", i), 20))
                .await
                .unwrap();
            poems.push(poem);
        }

        let consumer = Arc::new(RenameConsumer::new(
            Arc::new(db.rename_queue()),
            Arc::new(db.content()),
            ConsumerConfig {
                workers: 3,
                ..fast_config()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handles = consumer.spawn_workers(rx);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while db.rename_queue().count_by_status("done").await.unwrap() < 10 {
            assert!(tokio::time::Instant::now() < deadline, "queue not drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        for (i, poem) in poems.iter().enumerate() {
            let poem = db.content().get_poem(poem).await.unwrap().unwrap();
            assert_eq!(poem.author_name, format!("final-{}", i));
        }
    }
}
