//! Refresh token records and the storage interface the session service uses.

use async_trait::async_trait;

/// Why a refresh token was revoked. Recorded once, when `revoked` flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    /// Consumed by a successful refresh
    Rotated,
    /// Single-device logout
    Logout,
    /// Logout everywhere
    LogoutAll,
    /// Presented again after being revoked
    ReuseDetected,
}

impl RevokeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::Rotated => "rotated",
            RevokeReason::Logout => "logout",
            RevokeReason::LogoutAll => "logout_all",
            RevokeReason::ReuseDetected => "reuse_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rotated" => Some(RevokeReason::Rotated),
            "logout" => Some(RevokeReason::Logout),
            "logout_all" => Some(RevokeReason::LogoutAll),
            "reuse_detected" => Some(RevokeReason::ReuseDetected),
            _ => None,
        }
    }
}

/// A persisted refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub token_value: String,
    pub subject_id: String,
    /// Unix seconds. Fixed at creation.
    pub expires_at: u64,
    pub revoked: bool,
    pub revoke_reason: Option<RevokeReason>,
    /// Unix seconds
    pub created_at: u64,
}

/// Observable state of a single refresh token at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Revoked,
    Expired,
}

impl RefreshToken {
    /// A fresh, unrevoked record.
    pub fn new(token_value: String, subject_id: &str, created_at: u64, lifetime: u64) -> Self {
        Self {
            token_value,
            subject_id: subject_id.to_string(),
            expires_at: created_at + lifetime,
            revoked: false,
            revoke_reason: None,
            created_at,
        }
    }

    /// Revocation wins over expiry: a revoked token presented after its expiry
    /// is still a reuse.
    pub fn state(&self, now: u64) -> TokenState {
        if self.revoked {
            TokenState::Revoked
        } else if self.expires_at <= now {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }
}

/// Result of an atomic rotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The presented token was revoked and the replacement stored.
    Rotated,
    /// The presented token was already revoked; nothing was written.
    AlreadyRevoked,
    /// The presented token expired before `replacement.created_at`; nothing
    /// was written.
    Expired,
}

/// Errors returned by refresh token stores.
#[derive(Debug)]
pub enum TokenStoreError {
    /// No token with that value exists
    NotFound,
    /// A token with that value already exists; regenerate and retry
    Conflict,
    /// Underlying database failure
    Database(sqlx::Error),
}

impl std::fmt::Display for TokenStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStoreError::NotFound => write!(f, "Refresh token not found"),
            TokenStoreError::Conflict => write!(f, "Refresh token value already exists"),
            TokenStoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for TokenStoreError {}

impl From<sqlx::Error> for TokenStoreError {
    fn from(e: sqlx::Error) -> Self {
        let unique = e
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        if unique {
            TokenStoreError::Conflict
        } else {
            TokenStoreError::Database(e)
        }
    }
}

/// Persistent record of issued refresh tokens.
///
/// Every mutation is atomic with respect to other callers touching the same
/// token value.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Store a new token. Fails with `Conflict` if the value exists.
    async fn add(&self, token: &RefreshToken) -> Result<(), TokenStoreError>;

    async fn get_by_value(&self, token_value: &str) -> Result<Option<RefreshToken>, TokenStoreError>;

    /// Revoke one token. Revoking an already revoked token succeeds and keeps
    /// the original reason. Unknown values fail with `NotFound`.
    async fn revoke(&self, token_value: &str, reason: RevokeReason) -> Result<(), TokenStoreError>;

    /// Revoke every unrevoked token of a subject. Returns how many flipped.
    async fn revoke_all_for_subject(
        &self,
        subject_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, TokenStoreError>;

    /// Revoke `presented` and insert `replacement` as one unit.
    ///
    /// Only one caller can ever observe `Rotated` for a given presented value.
    /// Revocation and expiry (as of `replacement.created_at`) are checked in
    /// the same atomic step. On `Conflict` nothing is written and `presented`
    /// stays usable.
    async fn rotate(
        &self,
        presented: &str,
        replacement: &RefreshToken,
    ) -> Result<RotateOutcome, TokenStoreError>;

    /// All tokens of a subject, newest first.
    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<RefreshToken>, TokenStoreError>;
}
