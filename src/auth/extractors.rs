//! Axum extractors for bearer authentication.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use super::errors::{ApiAuthError, AuthErrorKind};
use super::state::HasTokenCodec;
use crate::jwt::AccessClaims;

/// Verified access token claims from `Authorization: Bearer <token>`.
///
/// Verification is signature and expiry only; no store is consulted.
pub struct BearerAuth(pub AccessClaims);

/// Token part of an `Authorization: Bearer` header value.
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl<S> FromRequestParts<S> for BearerAuth
where
    S: HasTokenCodec + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiAuthError(AuthErrorKind::NotAuthenticated))?;

        state
            .codec()
            .verify_access_token(token)
            .map(BearerAuth)
            .map_err(|e| {
                let kind = AuthErrorKind::from(&e);
                if kind == AuthErrorKind::Internal {
                    tracing::error!(error = %e, "Access token verification failed");
                }
                ApiAuthError(kind)
            })
    }
}
