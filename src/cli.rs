//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::db::Database;
use crate::rate_limit::DEFAULT_LOGIN_PER_MINUTE;
use crate::rename::ConsumerConfig;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MIN_JWT_SECRET_LENGTH: usize = 32;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "stanza",
    about = "Poetry community backend: sessions and author name propagation"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "STANZA_PORT", default_value = "7291")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "STANZA_DATABASE", default_value = "stanza.db")]
    pub database: String,

    /// Path to file containing JWT secret. Prefer using JWT_SECRET env var instead
    #[arg(long)]
    pub jwt_secret_file: Option<String>,

    /// Log output format
    #[arg(short, long, env = "STANZA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Set the Secure flag on cookies (enable when served over HTTPS)
    #[arg(long, env = "STANZA_SECURE_COOKIES")]
    pub secure_cookies: bool,

    /// Take the client IP from X-Forwarded-For (only behind a trusted proxy)
    #[arg(long, env = "STANZA_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Disable account creation over the API
    #[arg(long, env = "STANZA_NO_SIGNUP")]
    pub no_signup: bool,

    /// Login attempts allowed per minute per client IP
    #[arg(long, env = "STANZA_LOGIN_RATE_PER_MINUTE", default_value_t = DEFAULT_LOGIN_PER_MINUTE)]
    pub login_rate_per_minute: u32,

    /// Number of rename consumer workers
    #[arg(long, env = "STANZA_CONSUMER_WORKERS", default_value = "2",
        value_parser = clap::value_parser!(u16).range(1..))]
    pub consumer_workers: u16,

    /// Deliveries of a rename event before it is dead-lettered
    #[arg(long, env = "STANZA_MAX_DELIVERY_ATTEMPTS", default_value = "5",
        value_parser = clap::value_parser!(u32).range(1..))]
    pub max_delivery_attempts: u32,
}

/// Initialize logging based on the specified format.
/// `RUST_LOG` overrides the default `info` level.
pub fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Load JWT secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_jwt_secret(jwt_secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var("JWT_SECRET") {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var("JWT_SECRET") };
        secret
    } else if let Some(path) = jwt_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read JWT secret file");
                return None;
            }
        }
    } else {
        error!(
            "JWT secret is required. Set JWT_SECRET environment variable (recommended) or use --jwt-secret-file"
        );
        return None;
    };

    validate_jwt_secret(secret)
}

fn validate_jwt_secret(secret: String) -> Option<String> {
    if secret.len() < MIN_JWT_SECRET_LENGTH {
        error!(
            "JWT secret is shorter than {} characters. Use a longer secret",
            MIN_JWT_SECRET_LENGTH
        );
        return None;
    }
    Some(secret)
}

/// Build ServerConfig from validated arguments.
pub fn build_config(args: &Args, db: Database, jwt_secret: String) -> ServerConfig {
    ServerConfig {
        db,
        jwt_secret: jwt_secret.into_bytes(),
        secure_cookies: args.secure_cookies,
        trust_forwarded_for: args.trust_forwarded_for,
        no_signup: args.no_signup,
        login_rate_per_minute: args.login_rate_per_minute,
        consumer: ConsumerConfig {
            workers: usize::from(args.consumer_workers),
            max_attempts: args.max_delivery_attempts,
            ..ConsumerConfig::default()
        },
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}
