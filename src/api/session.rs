//! Session API endpoints.
//!
//! - POST `/login` - Exchange credentials for an access and a refresh token
//! - POST `/refresh` - Rotate the refresh token cookie
//! - POST `/logout` - Revoke the refresh token cookie and clear it
//! - POST `/logout-all` - Revoke every refresh token of the caller
//! - GET `/sessions` - List the caller's refresh tokens (values not exposed)

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    middleware,
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use super::error::ApiError;
use crate::auth::{BearerAuth, REFRESH_COOKIE_NAME, clear_refresh_cookie, get_cookie, refresh_cookie};
use crate::impl_has_token_codec;
use crate::jwt::unix_now;
use crate::rate_limit::{RateLimitConfig, rate_limit_login};
use crate::session::{IssuedSession, SessionError, SessionService, TokenState};

#[derive(Clone)]
pub struct SessionState {
    pub session: Arc<SessionService>,
    pub secure_cookies: bool,
    pub rate_limit_config: Arc<RateLimitConfig>,
}

impl_has_token_codec!(SessionState);

pub fn router(state: SessionState) -> Router {
    let login_router = Router::new()
        .route("/login", post(login))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.rate_limit_config.clone(),
            rate_limit_login,
        ));

    Router::new()
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/logout-all", post(logout_all))
        .route("/sessions", get(list_sessions))
        .with_state(state)
        .merge(login_router)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: String,
    refresh_token: String,
    subject_id: String,
    display_name: String,
    expires_in: u64,
}

/// Body plus the Set-Cookie header replacing the refresh token.
fn session_response(session: IssuedSession, secure: bool) -> Response {
    let cookie = refresh_cookie(&session.refresh_token, session.refresh_expires_in, secure);
    (
        StatusCode::OK,
        [(SET_COOKIE, cookie)],
        Json(SessionResponse {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            subject_id: session.subject_id,
            display_name: session.display_name,
            expires_in: session.expires_in,
        }),
    )
        .into_response()
}

async fn login(
    State(state): State<SessionState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .session
        .login(payload.username.trim(), &payload.password)
        .await?;
    Ok(session_response(session, state.secure_cookies))
}

/// Rotate the refresh token. Any failure clears the cookie.
async fn refresh(State(state): State<SessionState>, headers: HeaderMap) -> Response {
    let result = match get_cookie(&headers, REFRESH_COOKIE_NAME).filter(|t| !t.is_empty()) {
        Some(presented) => state.session.refresh(presented).await.map_err(ApiError::from),
        None => Err(ApiError::unauthorized("No refresh token")),
    };

    match result {
        Ok(session) => session_response(session, state.secure_cookies),
        Err(e) => (
            AppendHeaders([(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))]),
            e,
        )
            .into_response(),
    }
}

/// Revoke the presented refresh token and clear the cookie.
/// Succeeds even without a valid cookie.
async fn logout(State(state): State<SessionState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(presented) = get_cookie(&headers, REFRESH_COOKIE_NAME).filter(|t| !t.is_empty()) {
        match state.session.logout(presented).await {
            Ok(()) | Err(SessionError::InvalidToken) => {}
            Err(e) => error!(error = %e, "Failed to revoke refresh token"),
        }
    }

    (
        StatusCode::OK,
        AppendHeaders([(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))]),
        Json(serde_json::json!({ "success": true })),
    )
}

#[derive(Serialize)]
struct LogoutAllResponse {
    revoked: u64,
}

async fn logout_all(
    State(state): State<SessionState>,
    BearerAuth(claims): BearerAuth,
) -> Result<impl IntoResponse, ApiError> {
    let revoked = state.session.logout_everywhere(&claims.sub).await?;
    info!(subject_id = %claims.sub, revoked, "Logout everywhere requested");

    Ok((
        StatusCode::OK,
        AppendHeaders([(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))]),
        Json(LogoutAllResponse { revoked }),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    created_at: u64,
    expires_at: u64,
    active: bool,
    revoke_reason: Option<&'static str>,
}

#[derive(Serialize)]
struct ListSessionsResponse {
    sessions: Vec<SessionInfo>,
}

async fn list_sessions(
    State(state): State<SessionState>,
    BearerAuth(claims): BearerAuth,
) -> Result<impl IntoResponse, ApiError> {
    let now = unix_now().map_err(|e| {
        error!(error = %e, "Failed to read clock");
        ApiError::internal("Internal error")
    })?;
    let tokens = state.session.list_sessions(&claims.sub).await?;

    let sessions = tokens
        .into_iter()
        .map(|t| SessionInfo {
            created_at: t.created_at,
            expires_at: t.expires_at,
            active: t.state(now) == TokenState::Active,
            revoke_reason: t.revoke_reason.map(|r| r.as_str()),
        })
        .collect();

    Ok(Json(ListSessionsResponse { sessions }))
}
