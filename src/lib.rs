pub mod api;
pub mod auth;
pub mod cleanup;
pub mod cli;
pub mod db;
pub mod jwt;
pub mod rate_limit;
pub mod rename;
pub mod session;

use api::create_api_router;
use axum::Router;
use db::Database;
use jwt::TokenCodec;
use rate_limit::RateLimitConfig;
use rename::{ConsumerConfig, RenameConsumer};
use session::SessionService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// JWT secret for signing access tokens
    pub jwt_secret: Vec<u8>,
    /// Whether to set Secure flag on cookies (should be true in production with HTTPS)
    pub secure_cookies: bool,
    /// Take client IPs from X-Forwarded-For
    pub trust_forwarded_for: bool,
    /// Whether account creation over the API is disabled
    pub no_signup: bool,
    /// Login attempts per minute per client IP
    pub login_rate_per_minute: u32,
    /// Rename consumer workers and retry policy
    pub consumer: ConsumerConfig,
}

/// Build the session service over the SQLite stores.
pub fn create_session_service(config: &ServerConfig) -> Arc<SessionService> {
    Arc::new(SessionService::new(
        Arc::new(TokenCodec::new(&config.jwt_secret)),
        Arc::new(config.db.tokens()),
        Arc::new(config.db.users()),
    ))
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    let rate_limit_config = Arc::new(RateLimitConfig::new(
        config.login_rate_per_minute,
        config.trust_forwarded_for,
    ));

    let api_router = create_api_router(
        config.db.clone(),
        create_session_service(config),
        config.secure_cookies,
        config.no_signup,
        rate_limit_config,
    );

    Router::new().nest("/api", api_router)
}

/// Spawn the rename consumer workers. They stop once `shutdown` turns true.
pub fn start_consumers(config: &ServerConfig, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let consumer = Arc::new(RenameConsumer::new(
        Arc::new(config.db.rename_queue()),
        Arc::new(config.db.content()),
        config.consumer.clone(),
    ));
    consumer.spawn_workers(shutdown)
}

/// Run cleanup tasks and spawn background scheduler.
/// Call this before starting the server.
pub async fn init_cleanup(db: &Database) {
    cleanup::run_cleanup(db).await;
    cleanup::spawn_cleanup_scheduler(db.clone());
}

/// Serve on `listener` with the rename consumers running until `shutdown`
/// turns true or its sender is dropped. Returns once in-flight requests and
/// deliveries have finished.
pub async fn run_server(
    config: ServerConfig,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    // Consumers stop with the server, including when serving fails
    let (consumers_tx, consumers_rx) = watch::channel(false);
    let consumers = start_consumers(&config, consumers_rx);

    let app = create_app(&config);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, make_service)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

    let _ = consumers_tx.send(true);
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::error!(error = %e, "Rename consumer task failed");
        }
    }
    result
}

/// A server started in the background by [`start_server`].
pub struct RunningServer {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RunningServer {
    /// Stop accepting requests and wait for the server and its consumers.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Start the server and the rename consumers on the given port in background
/// tasks. Use port 0 to let the OS choose a random port.
pub async fn start_server(config: ServerConfig, port: u16) -> Result<RunningServer, std::io::Error> {
    // Run cleanup tasks on startup
    init_cleanup(&config.db).await;

    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        if let Err(e) = run_server(config, listener, shutdown_rx).await {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(RunningServer {
        addr: local_addr,
        handle,
        shutdown: shutdown_tx,
    })
}
