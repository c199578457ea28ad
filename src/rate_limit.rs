//! Rate limiting for the login endpoint.
//!
//! Uses a token bucket algorithm with per-IP tracking to slow down password
//! guessing.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::{num::NonZeroU32, sync::Arc};

use crate::auth::extract_client_ip;

/// Per-IP rate limiter.
pub type IpLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Default login attempts per minute per IP.
pub const DEFAULT_LOGIN_PER_MINUTE: u32 = 10;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub login: Arc<IpLimiter>,
    /// Read the client IP from `X-Forwarded-For`
    pub trust_forwarded_for: bool,
}

impl RateLimitConfig {
    /// `login_per_minute` of zero is treated as one.
    pub fn new(login_per_minute: u32, trust_forwarded_for: bool) -> Self {
        let per_minute = NonZeroU32::new(login_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            login: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            trust_forwarded_for,
        }
    }
}

/// Middleware for rate limiting login attempts.
///
/// Requests without a resolvable client IP share a single bucket.
pub async fn rate_limit_login(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&request, config.trust_forwarded_for)
        .unwrap_or_else(|| "unknown".to_string());

    match config.login.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(_) => {
            tracing::warn!(ip = %ip, "Login rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many login attempts. Please wait before trying again.",
            )
                .into_response()
        }
    }
}
