//! SQLite-backed refresh token storage.
//!
//! Rows are never deleted: a revoked token has to stay findable so that a
//! second presentation is recognized as reuse.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::session::{RefreshToken, RefreshTokenStore, RevokeReason, RotateOutcome, TokenStoreError};

#[derive(Clone)]
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct RefreshTokenRow {
    token_value: String,
    subject_id: String,
    expires_at: i64,
    revoked: bool,
    revoke_reason: Option<String>,
    created_at: i64,
}

impl From<RefreshTokenRow> for RefreshToken {
    fn from(row: RefreshTokenRow) -> Self {
        Self {
            token_value: row.token_value,
            subject_id: row.subject_id,
            expires_at: row.expires_at.max(0) as u64,
            revoked: row.revoked,
            revoke_reason: row.revoke_reason.as_deref().and_then(RevokeReason::parse),
            created_at: row.created_at.max(0) as u64,
        }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT token_value, subject_id, expires_at, revoked, revoke_reason, created_at FROM refresh_tokens";

impl SqliteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn exists_in<'e, E>(executor: E, token_value: &str) -> Result<bool, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        Ok(Self::revoked_flag(executor, token_value).await?.is_some())
    }

    /// `Some(revoked)` if the token exists.
    async fn revoked_flag<'e, E>(executor: E, token_value: &str) -> Result<Option<bool>, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT revoked FROM refresh_tokens WHERE token_value = ?")
                .bind(token_value)
                .fetch_optional(executor)
                .await?;
        Ok(row.map(|(revoked,)| revoked))
    }
}

#[async_trait]
impl RefreshTokenStore for SqliteTokenStore {
    async fn add(&self, token: &RefreshToken) -> Result<(), TokenStoreError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token_value, subject_id, expires_at, revoked, revoke_reason, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&token.token_value)
        .bind(&token.subject_id)
        .bind(token.expires_at as i64)
        .bind(token.revoked)
        .bind(token.revoke_reason.map(|r| r.as_str()))
        .bind(token.created_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_value(&self, token_value: &str) -> Result<Option<RefreshToken>, TokenStoreError> {
        let row: Option<RefreshTokenRow> =
            sqlx::query_as(&format!("{} WHERE token_value = ?", SELECT_COLUMNS))
                .bind(token_value)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(RefreshToken::from))
    }

    async fn revoke(&self, token_value: &str, reason: RevokeReason) -> Result<(), TokenStoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1, revoke_reason = ? WHERE token_value = ? AND revoked = 0",
        )
        .bind(reason.as_str())
        .bind(token_value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !Self::exists_in(&self.pool, token_value).await? {
            return Err(TokenStoreError::NotFound);
        }
        Ok(())
    }

    async fn revoke_all_for_subject(
        &self,
        subject_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, TokenStoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1, revoke_reason = ? WHERE subject_id = ? AND revoked = 0",
        )
        .bind(reason.as_str())
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn rotate(
        &self,
        presented: &str,
        replacement: &RefreshToken,
    ) -> Result<RotateOutcome, TokenStoreError> {
        let mut tx = self.pool.begin().await?;

        // The conditional update is the single point of arbitration: only one
        // transaction can flip `revoked` from 0 to 1, and never on an expired
        // token.
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1, revoke_reason = 'rotated' WHERE token_value = ? AND revoked = 0 AND expires_at > ?",
        )
        .bind(presented)
        .bind(replacement.created_at as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let revoked = Self::revoked_flag(&mut *tx, presented).await?;
            tx.rollback().await?;
            return match revoked {
                Some(true) => Ok(RotateOutcome::AlreadyRevoked),
                Some(false) => Ok(RotateOutcome::Expired),
                None => Err(TokenStoreError::NotFound),
            };
        }

        // A unique violation here drops `tx`, rolling back the revocation.
        sqlx::query(
            "INSERT INTO refresh_tokens (token_value, subject_id, expires_at, revoked, revoke_reason, created_at) VALUES (?, ?, ?, 0, NULL, ?)",
        )
        .bind(&replacement.token_value)
        .bind(&replacement.subject_id)
        .bind(replacement.expires_at as i64)
        .bind(replacement.created_at as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RotateOutcome::Rotated)
    }

    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<RefreshToken>, TokenStoreError> {
        let rows: Vec<RefreshTokenRow> = sqlx::query_as(&format!(
            "{} WHERE subject_id = ? ORDER BY created_at DESC, rowid DESC",
            SELECT_COLUMNS
        ))
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RefreshToken::from).collect())
    }
}
