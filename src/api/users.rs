//! User API endpoints.
//!
//! - POST `/` - Create an account (rate limited)
//! - GET `/me` - Claims of the presented access token
//! - PATCH `/me/name` - Rename the caller and publish the rename event

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::error::{ApiError, ResultExt, validate_username};
use crate::auth::BearerAuth;
use crate::db::Database;
use crate::impl_has_token_codec;
use crate::rate_limit::{RateLimitConfig, rate_limit_login};
use crate::session::SessionService;

/// Shortest accepted password.
const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Clone)]
pub struct UsersState {
    pub db: Database,
    pub session: Arc<SessionService>,
    pub no_signup: bool,
    pub rate_limit_config: Arc<RateLimitConfig>,
}

impl_has_token_codec!(UsersState);

pub fn router(state: UsersState) -> Router {
    let me_router = Router::new()
        .route("/me", get(me))
        .route("/me/name", patch(rename))
        .with_state(state.clone());

    if state.no_signup {
        me_router
    } else {
        let create_router = Router::new()
            .route("/", post(create_user))
            .with_state(state.clone())
            .layer(middleware::from_fn_with_state(
                state.rate_limit_config,
                rate_limit_login,
            ));

        Router::new().merge(me_router).merge(create_router)
    }
}

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    subject_id: String,
    display_name: String,
}

async fn create_user(
    State(state): State<UsersState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = validate_username(&payload.username)?;

    if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    if state
        .db
        .users()
        .get_by_username(username)
        .await
        .db_err("Failed to check username")?
        .is_some()
    {
        return Err(ApiError::conflict("Username already taken"));
    }

    let user = state
        .db
        .users()
        .create(username, &payload.password)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                ApiError::conflict("Username already taken")
            } else {
                ApiError::db_error("Failed to create user", e)
            }
        })?;

    info!(uuid = %user.uuid, "User created");

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            subject_id: user.uuid,
            display_name: user.username,
        }),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    subject_id: String,
    display_name: String,
    expires_at: u64,
}

/// Echo the verified claims. The display name is the one at issuance.
async fn me(BearerAuth(claims): BearerAuth) -> impl IntoResponse {
    Json(MeResponse {
        subject_id: claims.sub,
        display_name: claims.display_name,
        expires_at: claims.exp,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    display_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenameResponse {
    subject_id: String,
    old_display_name: String,
    display_name: String,
}

/// Rename the caller. Content copies follow asynchronously; the current
/// access token keeps the old name until the next refresh.
async fn rename(
    State(state): State<UsersState>,
    BearerAuth(claims): BearerAuth,
    Json(payload): Json<RenameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let display_name = validate_username(&payload.display_name)?;

    let event = state.db.users().rename(&claims.sub, display_name).await?;
    info!(subject_id = %event.subject_id, "User renamed");

    Ok(Json(RenameResponse {
        subject_id: event.subject_id,
        old_display_name: event.old_display_name,
        display_name: event.new_display_name,
    }))
}
