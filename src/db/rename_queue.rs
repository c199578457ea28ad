//! Durable rename event queue in the `rename_events` table.
//!
//! Status flow: `pending` -> `in_flight` -> `done` | `dead`, with
//! `in_flight` -> `pending` on nack. For `in_flight` rows `available_at` is
//! the lease expiry, after which the event can be claimed again.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::time::Duration;

use crate::rename::{Delivery, RenameEvent, RenameEventSource};

#[derive(Clone)]
pub struct RenameQueue {
    pool: SqlitePool,
}

/// An event that exhausted its retries or could not be parsed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub subject_id: String,
    pub payload: String,
    pub attempts: u32,
    pub reason: String,
    /// Unix milliseconds
    pub dead_at: i64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl RenameQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue an event outside any other transaction.
    pub async fn publish(&self, event: &RenameEvent) -> Result<i64, sqlx::Error> {
        let payload = event
            .to_json()
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        self.publish_raw(&event.subject_id, &payload).await
    }

    /// Enqueue an already serialized payload.
    pub async fn publish_raw(&self, subject_id: &str, payload: &str) -> Result<i64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let id = Self::publish_in(&mut tx, subject_id, payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Enqueue as part of the caller's transaction.
    pub async fn publish_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        subject_id: &str,
        payload: &str,
    ) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO rename_events (subject_id, payload, status, attempts, available_at, created_at) VALUES (?, ?, 'pending', 0, ?, ?)",
        )
        .bind(subject_id)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All dead-lettered events, oldest first.
    pub async fn dead_lettered(&self) -> Result<Vec<DeadLetter>, sqlx::Error> {
        let rows: Vec<(i64, String, String, i64, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT id, subject_id, payload, attempts, last_error, completed_at FROM rename_events WHERE status = 'dead' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, subject_id, payload, attempts, reason, dead_at)| DeadLetter {
                    id,
                    subject_id,
                    payload,
                    attempts: attempts.max(0) as u32,
                    reason: reason.unwrap_or_default(),
                    dead_at: dead_at.unwrap_or_default(),
                },
            )
            .collect())
    }

    /// Number of events in the given status.
    pub async fn count_by_status(&self, status: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM rename_events WHERE status = ?")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Delete acknowledged events completed more than `older_than` ago.
    pub async fn purge_done(&self, older_than: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = now_millis().saturating_sub(millis(older_than));
        let result =
            sqlx::query("DELETE FROM rename_events WHERE status = 'done' AND completed_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RenameEventSource for RenameQueue {
    async fn claim(&self, lease: Duration) -> Result<Option<Delivery>, sqlx::Error> {
        let now = now_millis();
        let lease_until = now.saturating_add(millis(lease));

        // Single statement, so two workers can never claim the same row.
        // An event waits while an earlier one for its subject is unresolved.
        let row: Option<(i64, String, String, i64)> = sqlx::query_as(
            "UPDATE rename_events
             SET status = 'in_flight', attempts = attempts + 1, claimed_at = ?1, available_at = ?2
             WHERE id = (
                 SELECT e.id FROM rename_events e
                 WHERE e.status IN ('pending', 'in_flight')
                   AND e.available_at <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM rename_events p
                       WHERE p.subject_id = e.subject_id
                         AND p.id < e.id
                         AND p.status IN ('pending', 'in_flight')
                   )
                 ORDER BY e.id
                 LIMIT 1
             )
             RETURNING id, subject_id, payload, attempts",
        )
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, subject_id, payload, attempts)| Delivery {
            id,
            subject_id,
            payload,
            attempts: attempts.max(0) as u32,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE rename_events SET status = 'done', completed_at = ?, last_error = NULL WHERE id = ? AND status = 'in_flight' AND attempts = ?",
        )
        .bind(now_millis())
        .bind(delivery.id)
        .bind(delivery.attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let available_at = now_millis().saturating_add(millis(retry_in));
        let result = sqlx::query(
            "UPDATE rename_events SET status = 'pending', available_at = ?, last_error = ? WHERE id = ? AND status = 'in_flight' AND attempts = ?",
        )
        .bind(available_at)
        .bind(error)
        .bind(delivery.id)
        .bind(delivery.attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE rename_events SET status = 'dead', completed_at = ?, last_error = ? WHERE id = ? AND status = 'in_flight' AND attempts = ?",
        )
        .bind(now_millis())
        .bind(reason)
        .bind(delivery.id)
        .bind(delivery.attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
