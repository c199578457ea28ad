//! Session lifecycle: login, refresh token rotation, logout.
//!
//! Every refresh consumes the presented token and replaces it in one atomic
//! store operation. Presenting a token that was already consumed or revoked is
//! treated as theft: every session of that subject is revoked and the client
//! has to log in again.

mod identity;
mod memory;
mod store;

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::jwt::{
    AccessTokenResult, JwtError, REFRESH_TOKEN_DURATION_SECS, TokenCodec,
    generate_refresh_token_value, unix_now,
};

pub use identity::{IdentityProvider, Subject};
pub use memory::MemoryTokenStore;
pub use store::{
    RefreshToken, RefreshTokenStore, RevokeReason, RotateOutcome, TokenState, TokenStoreError,
};

/// How many fresh values to try when a generated refresh token collides.
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// Tokens handed to a client after login or refresh.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub subject_id: String,
    pub display_name: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
}

impl IssuedSession {
    fn new(subject: Subject, access: AccessTokenResult, refresh: &RefreshToken) -> Self {
        Self {
            access_token: access.token,
            refresh_token: refresh.token_value.clone(),
            subject_id: subject.id,
            display_name: subject.display_name,
            expires_in: access.duration,
            refresh_expires_in: refresh.expires_at - refresh.created_at,
        }
    }
}

/// Errors surfaced by the session service.
#[derive(Debug)]
pub enum SessionError {
    /// Unknown user or wrong password
    InvalidCredentials,
    /// Unknown refresh token, or its subject no longer exists
    InvalidToken,
    /// Refresh token past its expiry
    TokenExpired,
    /// A revoked refresh token was presented; all sessions were revoked
    TokenReuseDetected,
    Codec(JwtError),
    Store(TokenStoreError),
    Identity(sqlx::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidCredentials => write!(f, "Invalid credentials"),
            SessionError::InvalidToken => write!(f, "Invalid refresh token"),
            SessionError::TokenExpired => write!(f, "Refresh token has expired"),
            SessionError::TokenReuseDetected => write!(f, "Refresh token reuse detected"),
            SessionError::Codec(e) => write!(f, "{}", e),
            SessionError::Store(e) => write!(f, "{}", e),
            SessionError::Identity(e) => write!(f, "Identity lookup failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<JwtError> for SessionError {
    fn from(e: JwtError) -> Self {
        SessionError::Codec(e)
    }
}

impl From<TokenStoreError> for SessionError {
    fn from(e: TokenStoreError) -> Self {
        SessionError::Store(e)
    }
}

/// Orchestrates the token codec, the refresh token store and the identity
/// provider.
pub struct SessionService {
    codec: Arc<TokenCodec>,
    store: Arc<dyn RefreshTokenStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl SessionService {
    pub fn new(
        codec: Arc<TokenCodec>,
        store: Arc<dyn RefreshTokenStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            codec,
            store,
            identity,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Verify credentials and start a new session lineage.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedSession, SessionError> {
        let subject = self
            .identity
            .verify_credentials(username, password)
            .await
            .map_err(SessionError::Identity)?
            .ok_or(SessionError::InvalidCredentials)?;

        let now = unix_now()?;
        let access = self
            .codec
            .issue_access_token_at(&subject.id, &subject.display_name, now)?;
        let refresh = self.issue_refresh_token(&subject.id, now).await?;

        info!(subject_id = %subject.id, "Session started");
        Ok(IssuedSession::new(subject, access, &refresh))
    }

    /// Exchange a refresh token for a new access token and a new refresh token.
    pub async fn refresh(&self, presented: &str) -> Result<IssuedSession, SessionError> {
        let now = unix_now()?;

        let token = self
            .store
            .get_by_value(presented)
            .await?
            .ok_or(SessionError::InvalidToken)?;

        match token.state(now) {
            TokenState::Revoked => return Err(self.reuse_detected(&token.subject_id).await),
            TokenState::Expired => return Err(SessionError::TokenExpired),
            TokenState::Active => {}
        }

        let subject = self
            .identity
            .find_subject(&token.subject_id)
            .await
            .map_err(SessionError::Identity)?
            .ok_or(SessionError::InvalidToken)?;

        let access = self
            .codec
            .issue_access_token_at(&subject.id, &subject.display_name, now)?;

        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let replacement = RefreshToken::new(
                generate_refresh_token_value(),
                &subject.id,
                now,
                REFRESH_TOKEN_DURATION_SECS,
            );

            match self.store.rotate(presented, &replacement).await {
                Ok(RotateOutcome::Rotated) => {
                    debug!(subject_id = %subject.id, "Refresh token rotated");
                    return Ok(IssuedSession::new(subject, access, &replacement));
                }
                // Lost a race against another refresh with the same token
                Ok(RotateOutcome::AlreadyRevoked) => {
                    return Err(self.reuse_detected(&token.subject_id).await);
                }
                Ok(RotateOutcome::Expired) => return Err(SessionError::TokenExpired),
                Err(TokenStoreError::Conflict) => {
                    warn!("Refresh token value collision, regenerating");
                }
                Err(TokenStoreError::NotFound) => return Err(SessionError::InvalidToken),
                Err(e) => return Err(e.into()),
            }
        }

        Err(SessionError::Store(TokenStoreError::Conflict))
    }

    /// Revoke only the presented refresh token; other devices stay logged in.
    pub async fn logout(&self, presented: &str) -> Result<(), SessionError> {
        match self.store.revoke(presented, RevokeReason::Logout).await {
            Ok(()) => Ok(()),
            Err(TokenStoreError::NotFound) => Err(SessionError::InvalidToken),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke every refresh token of a subject. Access tokens already issued
    /// stay valid until they expire.
    pub async fn logout_everywhere(&self, subject_id: &str) -> Result<u64, SessionError> {
        let count = self
            .store
            .revoke_all_for_subject(subject_id, RevokeReason::LogoutAll)
            .await?;
        info!(subject_id = %subject_id, revoked = count, "Logged out everywhere");
        Ok(count)
    }

    /// All refresh tokens of a subject, newest first.
    pub async fn list_sessions(&self, subject_id: &str) -> Result<Vec<RefreshToken>, SessionError> {
        Ok(self.store.list_for_subject(subject_id).await?)
    }

    async fn issue_refresh_token(&self, subject_id: &str, now: u64) -> Result<RefreshToken, SessionError> {
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let token = RefreshToken::new(
                generate_refresh_token_value(),
                subject_id,
                now,
                REFRESH_TOKEN_DURATION_SECS,
            );
            match self.store.add(&token).await {
                Ok(()) => return Ok(token),
                Err(TokenStoreError::Conflict) => {
                    warn!("Refresh token value collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SessionError::Store(TokenStoreError::Conflict))
    }

    async fn reuse_detected(&self, subject_id: &str) -> SessionError {
        match self
            .store
            .revoke_all_for_subject(subject_id, RevokeReason::ReuseDetected)
            .await
        {
            Ok(count) => warn!(
                target: "security",
                subject_id = %subject_id,
                revoked = count,
                "Refresh token reuse detected, all sessions revoked"
            ),
            Err(e) => error!(
                target: "security",
                subject_id = %subject_id,
                error = %e,
                "Refresh token reuse detected, revoking sessions failed"
            ),
        }
        SessionError::TokenReuseDetected
    }
}
