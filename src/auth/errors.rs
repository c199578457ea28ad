//! Bearer authentication errors.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::jwt::JwtError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// No `Authorization: Bearer` header
    NotAuthenticated,
    InvalidToken,
    TokenExpired,
    Internal,
}

impl From<&JwtError> for AuthErrorKind {
    fn from(e: &JwtError) -> Self {
        match e {
            JwtError::Expired => AuthErrorKind::TokenExpired,
            JwtError::InvalidSignature | JwtError::Malformed => AuthErrorKind::InvalidToken,
            JwtError::Encoding(_) | JwtError::TimeError => AuthErrorKind::Internal,
        }
    }
}

/// Rejection for API endpoints that require an access token.
#[derive(Debug)]
pub struct ApiAuthError(pub AuthErrorKind);

impl ApiAuthError {
    fn status_code(&self) -> StatusCode {
        match self.0 {
            AuthErrorKind::NotAuthenticated
            | AuthErrorKind::InvalidToken
            | AuthErrorKind::TokenExpired => StatusCode::UNAUTHORIZED,
            AuthErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &'static str {
        match self.0 {
            AuthErrorKind::NotAuthenticated => "Not authenticated",
            AuthErrorKind::InvalidToken => "Invalid access token",
            AuthErrorKind::TokenExpired => "Access token has expired",
            AuthErrorKind::Internal => "Internal error",
        }
    }
}

impl IntoResponse for ApiAuthError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
        }

        let status = self.status_code();
        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.message(),
            }),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            let challenge = match self.0 {
                AuthErrorKind::TokenExpired => {
                    "Bearer error=\"invalid_token\", error_description=\"expired\""
                }
                AuthErrorKind::InvalidToken => "Bearer error=\"invalid_token\"",
                _ => "Bearer",
            };
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        }

        response
    }
}
