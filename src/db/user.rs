use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::sync::LazyLock;

use super::rename_queue::RenameQueue;
use crate::rename::RenameEvent;
use crate::session::{IdentityProvider, Subject};

/// Hash checked when the username does not exist, so both failure paths cost
/// one Argon2 verification.
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("not-a-real-password").ok());

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub username: String,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    uuid: String,
    username: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            username: row.username,
        }
    }
}

impl From<User> for Subject {
    fn from(user: User) -> Self {
        Self {
            id: user.uuid,
            display_name: user.username,
        }
    }
}

/// Errors from renaming a user.
#[derive(Debug)]
pub enum RenameError {
    NotFound,
    UsernameTaken,
    Database(sqlx::Error),
}

impl std::fmt::Display for RenameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenameError::NotFound => write!(f, "User not found"),
            RenameError::UsernameTaken => write!(f, "Username is already taken"),
            RenameError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for RenameError {}

impl From<sqlx::Error> for RenameError {
    fn from(e: sqlx::Error) -> Self {
        let unique = e
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        if unique {
            RenameError::UsernameTaken
        } else {
            RenameError::Database(e)
        }
    }
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a user with a fresh UUID and an Argon2 password hash.
    pub async fn create(&self, username: &str, password: &str) -> Result<User, sqlx::Error> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?
            .map_err(|e| sqlx::Error::Encode(e.to_string().into()))?;

        let result =
            sqlx::query("INSERT INTO users (uuid, username, password_hash) VALUES (?, ?, ?)")
                .bind(&uuid)
                .bind(username)
                .bind(&password_hash)
                .execute(&self.pool)
                .await?;

        Ok(User {
            id: result.last_insert_rowid(),
            uuid,
            username: username.to_string(),
        })
    }

    /// Get a user by username.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, uuid, username FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by UUID.
    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, uuid, username FROM users WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Delete a user by UUID.
    pub async fn delete(&self, uuid: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Change a username and publish the rename event in the same transaction.
    ///
    /// Nothing is published when the update fails.
    pub async fn rename(&self, uuid: &str, new_username: &str) -> Result<RenameEvent, RenameError> {
        // Informational only; the consumer never relies on the old name.
        let old = self.get_by_uuid(uuid).await?.ok_or(RenameError::NotFound)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE users SET username = ? WHERE uuid = ?")
            .bind(new_username)
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RenameError::NotFound);
        }

        let event = RenameEvent {
            subject_id: uuid.to_string(),
            old_display_name: old.username,
            new_display_name: new_username.to_string(),
            timestamp: Utc::now(),
        };
        let payload = event
            .to_json()
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        RenameQueue::publish_in(&mut tx, &event.subject_id, &payload).await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn password_hash(&self, username: &str) -> Result<Option<(UserRow, String)>, sqlx::Error> {
        let row: Option<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, uuid, username, password_hash FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, uuid, username, hash)| (UserRow { id, uuid, username }, hash)))
    }
}

#[async_trait]
impl IdentityProvider for UserStore {
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Subject>, sqlx::Error> {
        let found = self.password_hash(username).await?;

        let hash = match &found {
            Some((_, hash)) => Some(hash.clone()),
            None => DUMMY_HASH.clone(),
        };
        let password = password.to_string();
        let matches = match hash {
            Some(hash) => tokio::task::spawn_blocking(move || verify_password(&password, &hash))
                .await
                .unwrap_or(false),
            None => false,
        };

        Ok(match found {
            Some((row, _)) if matches => Some(User::from(row).into()),
            _ => None,
        })
    }

    async fn find_subject(&self, subject_id: &str) -> Result<Option<Subject>, sqlx::Error> {
        Ok(self.get_by_uuid(subject_id).await?.map(Subject::from))
    }
}

/// Hash a password into a PHC string.
fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}
