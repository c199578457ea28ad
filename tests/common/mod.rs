#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use stanza::rename::ConsumerConfig;
use stanza::{ServerConfig, create_app, db::Database};
use std::time::Duration;
use tower::ServiceExt;

pub const TEST_SECRET: &[u8] = b"test-jwt-secret-that-is-32-bytes-or-more";

/// Config over a fresh in-memory database with generous rate limits.
pub async fn test_config() -> ServerConfig {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    ServerConfig {
        db,
        jwt_secret: TEST_SECRET.to_vec(),
        secure_cookies: false,
        trust_forwarded_for: false,
        no_signup: false,
        login_rate_per_minute: 1000,
        consumer: ConsumerConfig {
            workers: 2,
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            lease: Duration::from_secs(30),
        },
    }
}

pub struct TestApp {
    pub app: Router,
    pub db: Database,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config().await)
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            app: create_app(&config),
            db: config.db,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }

    /// Create an account directly in the database. Returns its UUID.
    pub async fn create_user(&self, username: &str, password: &str) -> String {
        self.db
            .users()
            .create(username, password)
            .await
            .expect("Failed to create user")
            .uuid
    }

    /// Log in and return `(access_token, refresh_token)`.
    pub async fn login(&self, username: &str, password: &str) -> (String, String) {
        let response = self
            .request(json_request(
                "POST",
                "/api/session/login",
                serde_json::json!({ "username": username, "password": password }),
            ))
            .await;
        assert_eq!(response.status(), 200, "login failed for {}", username);
        let json = body_json(response).await;
        (
            json["accessToken"].as_str().unwrap().to_string(),
            json["refreshToken"].as_str().unwrap().to_string(),
        )
    }

    /// POST `/api/session/refresh` with the given refresh cookie.
    pub async fn refresh(&self, refresh_token: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method("POST")
                .uri("/api/session/refresh")
                .header(header::COOKIE, format!("refresh_token={}", refresh_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn bearer_request(method: &str, uri: &str, access_token: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", access_token));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Value of the named cookie in the response's Set-Cookie headers.
pub fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let (pair, _) = cookie.split_once(';').unwrap_or((cookie, ""));
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
}

/// Full Set-Cookie header for the named cookie.
pub fn set_cookie_header(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|cookie| cookie.starts_with(&format!("{}=", name)))
        .map(str::to_string)
}
