mod error;
mod session;
mod users;

use axum::Router;
use std::sync::Arc;

use crate::db::Database;
use crate::rate_limit::RateLimitConfig;
use crate::session::SessionService;

pub use error::{ApiError, ResultExt};
pub use session::SessionState;
pub use users::UsersState;

/// Create the API router.
pub fn create_api_router(
    db: Database,
    session: Arc<SessionService>,
    secure_cookies: bool,
    no_signup: bool,
    rate_limit_config: Arc<RateLimitConfig>,
) -> Router {
    let session_state = session::SessionState {
        session: session.clone(),
        secure_cookies,
        rate_limit_config: rate_limit_config.clone(),
    };

    let users_state = users::UsersState {
        db,
        session,
        no_signup,
        rate_limit_config,
    };

    Router::new()
        .nest("/session", session::router(session_state))
        .nest("/users", users::router(users_state))
}
