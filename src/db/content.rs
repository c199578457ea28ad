//! Poems and comments, both carrying a denormalized author name.
//!
//! `author_name` is written at creation and afterwards only by
//! [`ContentStore::apply_rename`]. Other updates touch their own columns.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::rename::{NameHolderStore, RenameEvent, RenameOutcome};

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Poem {
    pub id: i64,
    pub uuid: String,
    pub author_id: String,
    pub author_name: String,
    pub title: String,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Comment {
    pub id: i64,
    pub uuid: String,
    pub poem_id: i64,
    pub author_id: String,
    pub author_name: String,
    pub body: String,
    pub created_at: String,
}

impl ContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_poem(
        &self,
        author_id: &str,
        author_name: &str,
        title: &str,
        body: &str,
    ) -> Result<Poem, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO poems (uuid, author_id, author_name, title, body) VALUES (?, ?, ?, ?, ?)
             RETURNING id, uuid, author_id, author_name, title, body, created_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(author_id)
        .bind(author_name)
        .bind(title)
        .bind(body)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn create_comment(
        &self,
        poem_id: i64,
        author_id: &str,
        author_name: &str,
        body: &str,
    ) -> Result<Comment, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO comments (uuid, poem_id, author_id, author_name, body) VALUES (?, ?, ?, ?, ?)
             RETURNING id, uuid, poem_id, author_id, author_name, body, created_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(poem_id)
        .bind(author_id)
        .bind(author_name)
        .bind(body)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_poem(&self, uuid: &str) -> Result<Option<Poem>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, uuid, author_id, author_name, title, body, created_at FROM poems WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_comment(&self, uuid: &str) -> Result<Option<Comment>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, uuid, poem_id, author_id, author_name, body, created_at FROM comments WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
    }

    /// Poems by one author, newest first.
    pub async fn list_poems_by_author(&self, author_id: &str) -> Result<Vec<Poem>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, uuid, author_id, author_name, title, body, created_at FROM poems WHERE author_id = ? ORDER BY id DESC",
        )
        .bind(author_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Edit a poem's text. Leaves `author_name` alone.
    pub async fn update_poem(&self, uuid: &str, title: &str, body: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE poems SET title = ?, body = ? WHERE uuid = ?")
            .bind(title)
            .bind(body)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Timestamp (Unix microseconds) and name of the newest rename applied
    /// for a subject.
    pub async fn rename_marker(&self, subject_id: &str) -> Result<Option<(i64, String)>, sqlx::Error> {
        sqlx::query_as(
            "SELECT last_applied_at, display_name FROM rename_markers WHERE subject_id = ?",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl NameHolderStore for ContentStore {
    async fn apply_rename(&self, event: &RenameEvent) -> Result<RenameOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Advance the marker first. The conditional upsert both takes the
        // write lock and decides staleness; equal timestamps reapply.
        let marker = sqlx::query(
            "INSERT INTO rename_markers (subject_id, last_applied_at, display_name) VALUES (?, ?, ?)
             ON CONFLICT(subject_id) DO UPDATE
             SET last_applied_at = excluded.last_applied_at, display_name = excluded.display_name
             WHERE excluded.last_applied_at >= rename_markers.last_applied_at",
        )
        .bind(&event.subject_id)
        .bind(event.timestamp_micros())
        .bind(&event.new_display_name)
        .execute(&mut *tx)
        .await?;

        if marker.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RenameOutcome::Stale);
        }

        let poems = sqlx::query("UPDATE poems SET author_name = ? WHERE author_id = ?")
            .bind(&event.new_display_name)
            .bind(&event.subject_id)
            .execute(&mut *tx)
            .await?;
        let comments = sqlx::query("UPDATE comments SET author_name = ? WHERE author_id = ?")
            .bind(&event.new_display_name)
            .bind(&event.subject_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RenameOutcome::Applied {
            updated: poems.rows_affected() + comments.rows_affected(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{TimeZone, Utc};

    fn event(subject: &str, name: &str, secs: i64) -> RenameEvent {
        RenameEvent {
            subject_id: subject.into(),
            old_display_name: String::new(),
            new_display_name: name.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_apply_rename_updates_poems_and_comments() {
        let db = Database::open(":memory:").await.unwrap();
        let content = db.content();
        let poem = content.create_poem("U1", "old", "Ode", "...").await.unwrap();
        let comment = content.create_comment(poem.id, "U1", "old", "self-reply").await.unwrap();
        let foreign = content.create_comment(poem.id, "U2", "eve", "hi").await.unwrap();

        let outcome = content.apply_rename(&event("U1", "new", 100)).await.unwrap();
        assert_eq!(outcome, RenameOutcome::Applied { updated: 2 });

        assert_eq!(content.get_poem(&poem.uuid).await.unwrap().unwrap().author_name, "new");
        assert_eq!(content.get_comment(&comment.uuid).await.unwrap().unwrap().author_name, "new");
        assert_eq!(content.get_comment(&foreign.uuid).await.unwrap().unwrap().author_name, "eve");

        let (at, name) = content.rename_marker("U1").await.unwrap().unwrap();
        assert_eq!(at, 100_000_000);
        assert_eq!(name, "new");
    }

    #[tokio::test]
    async fn test_apply_rename_twice_is_same_as_once() {
        let db = Database::open(":memory:").await.unwrap();
        let content = db.content();
        let poem = content.create_poem("U1", "old", "Ode", "...").await.unwrap();

        let e = event("U1", "new", 100);
        content.apply_rename(&e).await.unwrap();
        content.apply_rename(&e).await.unwrap();

        assert_eq!(content.get_poem(&poem.uuid).await.unwrap().unwrap().author_name, "new");
        assert_eq!(content.rename_marker("U1").await.unwrap().unwrap().0, 100_000_000);
    }

    #[tokio::test]
    async fn test_stale_rename_changes_nothing() {
        let db = Database::open(":memory:").await.unwrap();
        let content = db.content();
        let poem = content.create_poem("U1", "Robert", "Ode", "...").await.unwrap();

        content.apply_rename(&event("U1", "Bob", 10)).await.unwrap();
        let outcome = content.apply_rename(&event("U1", "Bobby", 5)).await.unwrap();
        assert_eq!(outcome, RenameOutcome::Stale);

        assert_eq!(content.get_poem(&poem.uuid).await.unwrap().unwrap().author_name, "Bob");
        assert_eq!(content.rename_marker("U1").await.unwrap().unwrap().1, "Bob");
    }

    #[tokio::test]
    async fn test_rename_without_holders_still_advances_marker() {
        let db = Database::open(":memory:").await.unwrap();
        let content = db.content();

        let outcome = content.apply_rename(&event("U9", "later", 50)).await.unwrap();
        assert_eq!(outcome, RenameOutcome::Applied { updated: 0 });

        // A poem created afterwards by an older write path is not renamed
        // back by a stale event
        content.create_poem("U9", "later", "Ode", "...").await.unwrap();
        let outcome = content.apply_rename(&event("U9", "earlier", 40)).await.unwrap();
        assert_eq!(outcome, RenameOutcome::Stale);
    }

    #[tokio::test]
    async fn test_text_edits_do_not_touch_author_name() {
        let db = Database::open(":memory:").await.unwrap();
        let content = db.content();
        let poem = content.create_poem("U1", "old", "Ode", "v1").await.unwrap();

        content.apply_rename(&event("U1", "new", 100)).await.unwrap();
        assert!(content.update_poem(&poem.uuid, "Ode II", "v2").await.unwrap());

        let poem = content.get_poem(&poem.uuid).await.unwrap().unwrap();
        assert_eq!(poem.title, "Ode II");
        assert_eq!(poem.author_name, "new");

        let listed = content.list_poems_by_author("U1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
