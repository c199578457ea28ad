//! Access token signing and verification, and refresh token value generation.
//!
//! Access tokens are HS256 JWTs verified without any store lookup. Refresh
//! tokens are opaque random strings; their state lives in the token store.

use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// JWT claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user UUID)
    pub sub: String,
    /// Display name at the time of issuance
    #[serde(rename = "name")]
    pub display_name: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Access token duration: 15 minutes
pub const ACCESS_TOKEN_DURATION_SECS: u64 = 15 * 60;

/// Refresh token duration: 7 days
pub const REFRESH_TOKEN_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Random bytes per refresh token value (256 bits).
pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Result of issuing an access token.
#[derive(Debug, Clone)]
pub struct AccessTokenResult {
    /// The JWT token string
    pub token: String,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: u64,
    /// Token duration in seconds
    pub duration: u64,
}

/// Signs and verifies access tokens with the single shared key.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenCodec {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Issue an access token expiring `ACCESS_TOKEN_DURATION_SECS` from now.
    pub fn issue_access_token(
        &self,
        subject_id: &str,
        display_name: &str,
    ) -> Result<AccessTokenResult, JwtError> {
        self.issue_access_token_at(subject_id, display_name, unix_now()?)
    }

    /// Issue an access token as if the current time were `now`.
    pub fn issue_access_token_at(
        &self,
        subject_id: &str,
        display_name: &str,
        now: u64,
    ) -> Result<AccessTokenResult, JwtError> {
        let exp = now + ACCESS_TOKEN_DURATION_SECS;

        let claims = AccessClaims {
            sub: subject_id.to_string(),
            display_name: display_name.to_string(),
            iat: now,
            exp,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(JwtError::Encoding)?;

        Ok(AccessTokenResult {
            token,
            expires_at: exp,
            duration: ACCESS_TOKEN_DURATION_SECS,
        })
    }

    /// Verify an access token against the current time.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, JwtError> {
        self.verify_access_token_at(token, unix_now()?)
    }

    /// Verify an access token as if the current time were `now`.
    ///
    /// The signature is checked before expiry, so a forged token reports
    /// `InvalidSignature` even when its claimed expiry has passed.
    pub fn verify_access_token_at(&self, token: &str, now: u64) -> Result<AccessClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        // Expiry is compared against the caller's clock below.
        validation.validate_exp = false;

        let token_data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => JwtError::InvalidSignature,
                _ => JwtError::Malformed,
            })?;

        if now > token_data.claims.exp {
            return Err(JwtError::Expired);
        }

        Ok(token_data.claims)
    }
}

/// Generate a new opaque refresh token value: 32 random bytes, base64url.
pub fn generate_refresh_token_value() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Current Unix time in seconds.
pub fn unix_now() -> Result<u64, JwtError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| JwtError::TimeError)
}

/// Errors that can occur during JWT operations.
#[derive(Debug)]
pub enum JwtError {
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
    /// Signature does not match the signing key
    InvalidSignature,
    /// Token is past its expiry
    Expired,
    /// Token structure or claims could not be parsed
    Malformed,
    /// System time error
    TimeError,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
            JwtError::InvalidSignature => write!(f, "Invalid token signature"),
            JwtError::Expired => write!(f, "Token has expired"),
            JwtError::Malformed => write!(f, "Malformed token"),
            JwtError::TimeError => write!(f, "System time error"),
        }
    }
}

impl std::error::Error for JwtError {}
