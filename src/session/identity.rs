//! Credential verification, owned by the identity domain.

use async_trait::async_trait;

/// A verified account as seen by the session service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Stable subject id (user UUID)
    pub id: String,
    /// Current display name
    pub display_name: String,
}

/// Source of truth for credentials and current display names.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check a username/password pair. `None` for an unknown user or a wrong
    /// password alike.
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Subject>, sqlx::Error>;

    /// Look up a subject by id, `None` if the account no longer exists.
    async fn find_subject(&self, subject_id: &str) -> Result<Option<Subject>, sqlx::Error>;
}
