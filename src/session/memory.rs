//! In-memory refresh token store, used in tests and single-process setups.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::store::{RefreshToken, RefreshTokenStore, RevokeReason, RotateOutcome, TokenStoreError};

/// Refresh token store backed by a mutex-guarded map.
///
/// Each operation holds the lock for its whole duration, which makes
/// rotation a single critical section.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, RefreshToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RefreshToken>> {
        // Mutations below run only after all checks, so a poisoned map is consistent.
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryTokenStore {
    async fn add(&self, token: &RefreshToken) -> Result<(), TokenStoreError> {
        let mut tokens = self.lock();
        if tokens.contains_key(&token.token_value) {
            return Err(TokenStoreError::Conflict);
        }
        tokens.insert(token.token_value.clone(), token.clone());
        Ok(())
    }

    async fn get_by_value(&self, token_value: &str) -> Result<Option<RefreshToken>, TokenStoreError> {
        Ok(self.lock().get(token_value).cloned())
    }

    async fn revoke(&self, token_value: &str, reason: RevokeReason) -> Result<(), TokenStoreError> {
        let mut tokens = self.lock();
        let token = tokens
            .get_mut(token_value)
            .ok_or(TokenStoreError::NotFound)?;
        if !token.revoked {
            token.revoked = true;
            token.revoke_reason = Some(reason);
        }
        Ok(())
    }

    async fn revoke_all_for_subject(
        &self,
        subject_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, TokenStoreError> {
        let mut tokens = self.lock();
        let mut count = 0;
        for token in tokens
            .values_mut()
            .filter(|t| t.subject_id == subject_id && !t.revoked)
        {
            token.revoked = true;
            token.revoke_reason = Some(reason);
            count += 1;
        }
        Ok(count)
    }

    async fn rotate(
        &self,
        presented: &str,
        replacement: &RefreshToken,
    ) -> Result<RotateOutcome, TokenStoreError> {
        let mut tokens = self.lock();
        match tokens.get(presented) {
            None => return Err(TokenStoreError::NotFound),
            Some(t) if t.revoked => return Ok(RotateOutcome::AlreadyRevoked),
            Some(t) if t.expires_at <= replacement.created_at => return Ok(RotateOutcome::Expired),
            Some(_) => {}
        }
        if tokens.contains_key(&replacement.token_value) {
            return Err(TokenStoreError::Conflict);
        }

        if let Some(old) = tokens.get_mut(presented) {
            old.revoked = true;
            old.revoke_reason = Some(RevokeReason::Rotated);
        }
        tokens.insert(replacement.token_value.clone(), replacement.clone());
        Ok(RotateOutcome::Rotated)
    }

    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<RefreshToken>, TokenStoreError> {
        let mut list: Vec<RefreshToken> = self
            .lock()
            .values()
            .filter(|t| t.subject_id == subject_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}
